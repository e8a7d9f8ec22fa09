//! Channel I/O: ingestion, mail sync, reply transports and the operator feed.

pub mod email;
pub mod ingest;
pub mod mail_sync;
pub mod operator;
pub mod sms;
pub mod transport;

pub use email::SmtpMailer;
pub use ingest::build_app;
pub use mail_sync::{GraphMailApi, MailApi, MailPoller, SyncCursorManager, spawn_sync_ticker};
pub use operator::{Notice, OperatorFeed, OperatorNotifier};
pub use sms::SmsGateway;
pub use transport::{Dispatcher, Outbound, ReplyTransport};
