//! # Sensorlink Core Library
//!
//! Core functionality for communicating with wearable biosensor devices
//! over a serial link.
//!
//! This library provides:
//! - The framed binary wire codec and typed attribute catalog
//! - A concurrent communicator: synchronous and asynchronous sends,
//!   response correlation with timeouts, and subscriber callbacks on
//!   dedicated single-worker pools
//! - Device discovery across USB serial ports
//! - File download with progress reporting
//!
//! ## Example
//!
//! ```rust,ignore
//! use sensorlink_core::prelude::*;
//! use std::time::Duration;
//!
//! let mut config = CommConfig::default();
//! config.address = sensorlink_core::protocol::serial::find_device_port()?;
//!
//! let comm = Communicator::new(config);
//! comm.connect()?;
//!
//! let helper = SendHelper::new(&comm, Duration::from_secs(30));
//! println!("battery: {}%", helper.get_battery_level()?);
//! comm.shutdown();
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod helpers;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::codec::attributes::Attribute;
    pub use crate::codec::{FileEntry, Message};
    pub use crate::helpers::SendHelper;
    pub use crate::protocol::{
        CommConfig, Communicator, ConnectionListener, ConnectionState, FileDownloadListener,
        FileTransferListener, MessageListener, ProtocolError, ResponseListener, StatsSnapshot,
        SubscriberToken,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
