//! Text renderings for published values.

pub fn watts(value: f64) -> String {
    format!("{value:.1}W")
}

pub fn kilowatt_hours(value: f64) -> String {
    format!("{value:.2}kWh")
}

pub fn amps(value: f64) -> String {
    format!("{value:.1}A")
}

pub fn volts(value: f64) -> String {
    format!("{value:.1}V")
}

pub fn volts_dc(value: f64) -> String {
    format!("{value:.1}V DC")
}

pub fn celsius(value: f64) -> String {
    format!("{value:.1}°C")
}

pub fn percent(value: f64) -> String {
    format!("{value:.0}%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_precision() {
        assert_eq!(watts(-123.456), "-123.5W");
        assert_eq!(kilowatt_hours(812.3449), "812.34kWh");
        assert_eq!(amps(6.070000172), "6.1A");
        assert_eq!(volts(231.44), "231.4V");
        assert_eq!(volts_dc(33.06), "33.1V DC");
        assert_eq!(celsius(41.0), "41.0°C");
        assert_eq!(percent(63.0), "63%");
    }
}
