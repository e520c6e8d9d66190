use lapin::message::Delivery;
use lapin::types::{DeliveryTag, FieldTable, ShortString};

/// Owned snapshot of the delivery fields the library still needs once the
/// borrow on the lapin delivery ends: the tag for acking, the originating
/// exchange for requeue routing, and the body/headers/identity props the
/// retry engine republishes.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryInfo {
    pub delivery_tag: DeliveryTag,
    pub exchange: ShortString,
    pub data: Vec<u8>,
    pub headers: FieldTable,
    pub app_id: Option<ShortString>,
    pub message_id: Option<ShortString>,
}

impl DeliveryInfo {
    pub fn new(delivery: &Delivery) -> Self {
        DeliveryInfo {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.clone(),
            data: delivery.data.clone(),
            headers: delivery.properties.headers().clone().unwrap_or_default(),
            app_id: delivery.properties.app_id().clone(),
            message_id: delivery.properties.message_id().clone(),
        }
    }

    pub fn with_app_id(mut self, app_id: ShortString) -> Self {
        self.app_id = Some(app_id);
        self
    }

    pub fn with_message_id(mut self, message_id: ShortString) -> Self {
        self.message_id = Some(message_id);
        self
    }
}
