//! PostgreSQL wire protocol framing and message builders

pub mod error_response;
pub mod frame;

pub use frame::{
    first_client_packet_length, has_complete_message, message_type, ready_for_query_status,
    startup_parameter, try_extract_message, try_extract_startup, Frame, FrameError,
};
