//! Built-in outage strategies

use fleet_core::{DeviceStatus, ModuleId};
use serde_json::{json, Value};

use super::registry::ModuleAggregator;

pub const MISSION_MODULE: ModuleId = 1;
pub const CAR_ACCESSORY_MODULE: ModuleId = 2;

/// Mission module: reports how many statuses were missed
pub struct MissionAggregator;

impl ModuleAggregator for MissionAggregator {
    fn summarize(&self, statuses: &[DeviceStatus]) -> Vec<u8> {
        json!({ "status_count": statuses.len() }).to_string().into_bytes()
    }
}

/// Car accessory module: counts button presses from the `pressed` field
pub struct CarAccessoryAggregator;

impl CarAccessoryAggregator {
    fn pressed(status: &DeviceStatus) -> Option<bool> {
        let value: Value = serde_json::from_slice(&status.status_data).ok()?;
        value.get("pressed").map(truthy)
    }
}

impl ModuleAggregator for CarAccessoryAggregator {
    fn summarize(&self, statuses: &[DeviceStatus]) -> Vec<u8> {
        let mut pressed_count = 0usize;
        for status in statuses {
            match Self::pressed(status) {
                Some(true) => pressed_count += 1,
                Some(false) => {}
                None => {
                    return json!({
                        "error": "CarAccessoryErrorAggregator, found not supported status."
                    })
                    .to_string()
                    .into_bytes();
                }
            }
        }

        json!({
            "pressed_count": pressed_count,
            "not_pressed_count": statuses.len() - pressed_count,
            "total_statuses": statuses.len(),
        })
        .to_string()
        .into_bytes()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Device;

    fn status(data: &str) -> DeviceStatus {
        DeviceStatus::new(Device::new(2, 0, "left", "button"), data.as_bytes().to_vec())
    }

    fn parse(bytes: Vec<u8>) -> Value {
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_mission_counts_statuses() {
        let summary = MissionAggregator.summarize(&[status("a"), status("b"), status("c")]);
        assert_eq!(parse(summary), json!({"status_count": 3}));
    }

    #[test]
    fn test_car_accessory_counts_presses() {
        let log = [
            status(r#"{"pressed": true}"#),
            status(r#"{"pressed": false}"#),
            status(r#"{"pressed": 1}"#),
        ];
        assert_eq!(
            parse(CarAccessoryAggregator.summarize(&log)),
            json!({"pressed_count": 2, "not_pressed_count": 1, "total_statuses": 3})
        );
    }

    #[test]
    fn test_car_accessory_rejects_unsupported_status() {
        let log = [status(r#"{"pressed": true}"#), status(r#"{"speed": 4}"#)];
        let summary = parse(CarAccessoryAggregator.summarize(&log));
        assert!(summary.get("error").is_some());

        let garbage = parse(CarAccessoryAggregator.summarize(&[status("not json")]));
        assert!(garbage.get("error").is_some());
    }
}
