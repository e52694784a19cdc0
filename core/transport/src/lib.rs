//! HTTP transport abstraction for Tether.
//!
//! The offline layer never talks to the network directly: every attempt
//! goes through an [`HttpTransport`]. [`ReqwestTransport`] is the real
//! implementation; [`MockTransport`] is a scripted stand-in for tests.
//!
//! A transport returns the response for any status code. Classifying
//! non-2xx statuses as failures is the executor's job.

pub mod http;
pub mod mock;
pub mod transport;

pub use http::ReqwestTransport;
pub use mock::{MockReply, MockTransport};
pub use transport::HttpTransport;
