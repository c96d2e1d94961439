//! Property tests for configuration decoding.

use proptest::prelude::*;
use reaper_server::{TriggerConfig, TriggerMode};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// The combined switch is a two-bit field: listener high, connection low.
    #[test]
    fn prop_combined_trigger_mode_bits(mode in any::<u8>()) {
        match TriggerConfig::from_combined(mode) {
            Some(trigger) => {
                prop_assert!(mode <= 3);
                prop_assert_eq!(trigger.listener == TriggerMode::Edge, mode & 0b10 != 0);
                prop_assert_eq!(trigger.connection == TriggerMode::Edge, mode & 0b01 != 0);
            },
            None => prop_assert!(mode > 3),
        }
    }
}
