use strum::Display;

/// What the slow timer asks of the inverter relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RelayAction {
    /// Control loop ran and the battery may discharge: keep inverters on grid
    #[strum(to_string = "switch relay on")]
    KeepAlive,
    /// Feed-in has been negative for too long
    #[strum(to_string = "permanent negative grid, switch relay off")]
    SwitchOff,
    /// No control cycle ran or SOC is below the window: let the keep-alive lapse
    #[strum(to_string = "configured min SOC reached, relay keep-alive lapses")]
    Lapse,
}

pub fn decide(
    loop_index: u32,
    soc: i32,
    min_soc: i32,
    feed_in_index: u8,
    feed_in_index_limit: u8,
) -> RelayAction {
    if loop_index > 0 && soc >= min_soc {
        if feed_in_index < feed_in_index_limit {
            RelayAction::KeepAlive
        } else {
            RelayAction::SwitchOff
        }
    } else {
        RelayAction::Lapse
    }
}
