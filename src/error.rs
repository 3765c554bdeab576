//! Synchronous failure taxonomy for the public API.
//!
//! These cover argument validation and session preconditions that are
//! checked before anything is enqueued. Asynchronous outcomes (connect
//! failures, attribute statuses) travel on the event channels instead.

use thiserror::Error;

use crate::models::{CharacteristicId, DescriptorId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BleError {
    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("no peripheral known at {0}")]
    UnknownPeripheral(String),

    #[error("peripheral is not connected")]
    NotConnected,

    #[error("characteristic {0:?} not found on this peripheral")]
    CharacteristicNotFound(CharacteristicId),

    #[error("descriptor {0:?} not found on this peripheral")]
    DescriptorNotFound(DescriptorId),

    #[error("characteristic does not support reading")]
    NotReadable,

    #[error("characteristic does not support the requested write type")]
    NotWritable,

    #[error("characteristic supports neither notifications nor indications")]
    NotifyNotSupported,

    #[error("value is empty")]
    EmptyValue,

    #[error("value of {length} bytes exceeds the maximum of {maximum}")]
    ValueTooLong { length: usize, maximum: usize },

    #[error("mtu {0} is out of range 23..=517")]
    InvalidMtu(u16),

    #[error("pin code must be exactly 6 digits")]
    InvalidPinCode,

    #[error("session queue is gone; peripheral is shutting down")]
    SessionClosed,
}
