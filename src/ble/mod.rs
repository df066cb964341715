//! The BLE transport: HAP PDU framing, the GATT transaction engine, the procedure dispatcher
//! and broadcast notification configuration.

pub mod broadcast;
pub mod pdu;
pub mod procedure;
pub mod transaction;
