use uuid::Uuid;

/// Blood pressure measurement, the characteristic records arrive on
pub const MEASUREMENT_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a35_0000_1000_8000_00805f9b34fb);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sig_short_form() {
        assert_eq!(
            MEASUREMENT_CHARACTERISTIC.to_string(),
            "00002a35-0000-1000-8000-00805f9b34fb"
        );
    }
}
