//! Demo service hosted by `meshrpc serve`.

use std::sync::Arc;

use futures::stream;
use meshrpc_common::protocol::error::{MeshError, Result};
use meshrpc_server::{ServiceBinding, ServiceProvider};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

pub const SERVICE_NAME: &str = "io.meshrpc.Echo";

/// Upper bound for `echo/repeat`.
const MAX_REPEAT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repeat {
    pub text: String,
    pub count: usize,
}

/// Echoes whatever it is sent.
///
/// - `echo`: request-response, returns the payload unchanged
/// - `repeat`: request-stream, yields `text` `count` times
/// - `log`: one-way, logs the payload
#[derive(Debug, Default)]
pub struct EchoService;

impl ServiceProvider for EchoService {
    fn bindings(self: Arc<Self>) -> Result<Vec<ServiceBinding>> {
        let binding = ServiceBinding::builder(SERVICE_NAME)
            .request_response("echo", |value: Value| async move { Ok(value) })
            .request_stream("repeat", |request: Repeat| {
                let items: Vec<Result<String>> = if request.count > MAX_REPEAT {
                    vec![Err(MeshError::application(
                        400,
                        format!("count must be at most {}", MAX_REPEAT),
                    ))]
                } else {
                    (0..request.count).map(|_| Ok(request.text.clone())).collect()
                };
                stream::iter(items)
            })
            .one_way("log", |value: Value| async move {
                info!("echo/log: {}", value);
                Ok(())
            })
            .build()?;
        Ok(vec![binding])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_common::CommunicationMode;

    #[test]
    fn test_declares_three_methods() {
        let bindings = Arc::new(EchoService).bindings().unwrap();
        assert_eq!(bindings.len(), 1);

        let descriptor = bindings[0].descriptor();
        assert_eq!(descriptor.name(), SERVICE_NAME);
        assert_eq!(descriptor.method("echo").unwrap().mode(), CommunicationMode::RequestResponse);
        assert_eq!(descriptor.method("repeat").unwrap().mode(), CommunicationMode::RequestStream);
        assert_eq!(descriptor.method("log").unwrap().mode(), CommunicationMode::OneWay);
    }
}
