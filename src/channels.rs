use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub from_mqtt: broadcast::Sender<mqtt::ChannelData>,
    pub to_mqtt: broadcast::Sender<mqtt::ChannelData>,
    pub to_coordinator: broadcast::Sender<coordinator::ChannelData>,
    pub to_database: broadcast::Sender<database::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            from_mqtt: Self::channel(),
            to_mqtt: Self::channel(),
            to_coordinator: Self::channel(),
            to_database: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }

    /// Queues a bus message. With the bus disabled nobody listens and the
    /// message is dropped.
    pub fn publish(&self, message: mqtt::Message) {
        if self.to_mqtt.send(mqtt::ChannelData::Message(message)).is_err() {
            trace!("no bus sender listening, message dropped");
        }
    }
}
