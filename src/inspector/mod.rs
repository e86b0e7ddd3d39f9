pub mod store;

pub use store::{DeliveryCursor, DeliveryPage, ListDeliveriesParams, list_attempts, list_deliveries};
