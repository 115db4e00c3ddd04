use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

const CHANNEL_PREFIX: &str = "vehicle_";

/// `LISTEN` channel name for a vehicle.
pub fn channel_name(vehicle_id: Ulid) -> String {
    format!("{CHANNEL_PREFIX}{vehicle_id}")
}

/// Inverse of [`channel_name`]. Case-insensitive on the prefix.
pub fn parse_channel(channel: &str) -> Option<Ulid> {
    let channel = channel.trim().trim_matches('"');
    let prefix = channel.get(..CHANNEL_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(CHANNEL_PREFIX) {
        return None;
    }
    Ulid::from_string(&channel[CHANNEL_PREFIX.len()..]).ok()
}

/// JSON body of a notification: `{"event": "<name>", "data": {...}}`.
pub fn payload(event: &Event) -> String {
    let (name, data) = match serde_json::to_value(event) {
        Ok(serde_json::Value::Object(map)) => match map.into_iter().next() {
            Some((name, data)) => (name, data),
            None => (String::new(), serde_json::Value::Null),
        },
        Ok(other) => (String::new(), other),
        Err(e) => {
            tracing::warn!("could not encode notification: {e}");
            (String::new(), serde_json::Value::Null)
        }
    };
    serde_json::json!({ "event": snake_case(&name), "data": data }).to_string()
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Per-vehicle broadcast channels behind `LISTEN vehicle_<id>`.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, vehicle_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(vehicle_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to every vehicle the event touches. Channels whose listeners
    /// have all gone away are dropped.
    pub fn send(&self, event: &Event) {
        for vehicle_id in event.vehicle_ids() {
            let delivered = match self.channels.get(&vehicle_id) {
                Some(sender) => sender.send(event.clone()).is_ok(),
                None => continue,
            };
            if !delivered {
                self.channels
                    .remove_if(&vehicle_id, |_, sender| sender.receiver_count() == 0);
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
