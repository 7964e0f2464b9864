pub mod commerce;
pub mod order;
pub mod order_item;
pub mod order_status_history;
