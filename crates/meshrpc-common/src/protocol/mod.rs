pub mod error;
pub mod message;
pub mod mode;
pub mod qualifier;


pub use error::{codes, ErrorData, MeshError, Result};
pub use message::{
    Payload, ServiceMessage, DEFAULT_CONTENT_TYPE, HEADER_CONTENT_TYPE, HEADER_ERROR_CODE,
};
pub use mode::CommunicationMode;
pub use qualifier::Qualifier;
