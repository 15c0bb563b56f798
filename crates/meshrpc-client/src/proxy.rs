use std::marker::PhantomData;
use std::sync::Arc;

use meshrpc_common::protocol::error::{MeshError, Result};
use meshrpc_common::transport::Exchange;
use meshrpc_common::{CommunicationMode, MethodDescriptor, ServiceDescriptor, ServiceMessage, TypeTag};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::call::ServiceCall;
use crate::stream::ResponseStream;

/// Client stub for one service.
///
/// Hands out one typed handle per method. Each handle is checked against
/// the descriptor when it is created: asking for a method the service does
/// not declare, with another communication mode or with types that do not
/// match, fails right there with [`MeshError::Definition`] instead of on
/// the first call.
///
/// # Example
///
/// ```rust,no_run
/// # use meshrpc_client::ServiceCall;
/// # use meshrpc_common::ServiceDescriptor;
/// # async fn example(call: ServiceCall) -> meshrpc_common::Result<()> {
/// let greeting = ServiceDescriptor::builder("io.example.Greeting")
///     .request_response::<String, String>("greeting")
///     .build()?;
///
/// let api = call.api(&greeting);
/// let hello = api.request_response::<String, String>("greeting")?;
/// let reply = hello.call("joe".to_string()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    descriptor: Arc<ServiceDescriptor>,
    call: ServiceCall,
}

impl ServiceProxy {
    pub fn new(descriptor: ServiceDescriptor, call: ServiceCall) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            call,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Same stub on top of another pipeline, e.g. one with a shorter timeout.
    pub fn with_call(&self, call: ServiceCall) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            call,
        }
    }

    pub fn fire_and_forget(&self, method: &str) -> Result<FireAndForgetMethod> {
        let method = self.lookup::<(), ()>(method, CommunicationMode::FireAndForget)?;
        Ok(FireAndForgetMethod {
            method,
            call: self.call.clone(),
        })
    }

    pub fn one_way<Req>(&self, method: &str) -> Result<OneWayMethod<Req>>
    where
        Req: Serialize + 'static,
    {
        let method = self.lookup::<Req, ()>(method, CommunicationMode::OneWay)?;
        Ok(OneWayMethod {
            method,
            call: self.call.clone(),
            _types: PhantomData,
        })
    }

    pub fn request_response<Req, Resp>(&self, method: &str) -> Result<RequestResponseMethod<Req, Resp>>
    where
        Req: Serialize + 'static,
        Resp: DeserializeOwned + 'static,
    {
        let method = self.lookup::<Req, Resp>(method, CommunicationMode::RequestResponse)?;
        Ok(RequestResponseMethod {
            method,
            call: self.call.clone(),
            _types: PhantomData,
        })
    }

    pub fn request_stream<Req, Resp>(&self, method: &str) -> Result<RequestStreamMethod<Req, Resp>>
    where
        Req: Serialize + 'static,
        Resp: DeserializeOwned + 'static,
    {
        let method = self.lookup::<Req, Resp>(method, CommunicationMode::RequestStream)?;
        Ok(RequestStreamMethod {
            method,
            call: self.call.clone(),
            _types: PhantomData,
        })
    }

    /// Untyped handle for any declared method.
    pub fn raw(&self, method: &str) -> Result<RawMethod> {
        let method = self
            .descriptor
            .method(method)
            .cloned()
            .ok_or_else(|| self.undeclared(method))?;
        Ok(RawMethod {
            method,
            call: self.call.clone(),
        })
    }

    fn lookup<Req: 'static, Resp: 'static>(
        &self,
        name: &str,
        mode: CommunicationMode,
    ) -> Result<MethodDescriptor> {
        let method = self.descriptor.method(name).ok_or_else(|| self.undeclared(name))?;

        if method.mode() != mode {
            return Err(MeshError::Definition(format!(
                "{} is declared as {}, not {}",
                method.qualifier(),
                method.mode().as_str(),
                mode.as_str()
            )));
        }

        let request = TypeTag::of::<Req>();
        if !method.parameter_type().accepts(&request) {
            return Err(MeshError::Definition(format!(
                "{} takes {}, not {}",
                method.qualifier(),
                method.parameter_type(),
                request
            )));
        }

        let response = TypeTag::of::<Resp>();
        if !method.response_type().accepts(&response) {
            return Err(MeshError::Definition(format!(
                "{} returns {}, not {}",
                method.qualifier(),
                method.response_type(),
                response
            )));
        }

        Ok(method.clone())
    }

    fn undeclared(&self, name: &str) -> MeshError {
        MeshError::Definition(format!("service {} has no method {}", self.descriptor.name(), name))
    }
}

/// Handle for a fire-and-forget method.
#[derive(Debug, Clone)]
pub struct FireAndForgetMethod {
    method: MethodDescriptor,
    call: ServiceCall,
}

impl FireAndForgetMethod {
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.method
    }

    pub async fn call(&self) -> Result<()> {
        let message = self.method.request_message(&())?;
        self.call.fire_and_forget(message).await
    }
}

/// Handle for a one-way method.
#[derive(Debug)]
pub struct OneWayMethod<Req> {
    method: MethodDescriptor,
    call: ServiceCall,
    _types: PhantomData<fn(Req)>,
}

impl<Req: Serialize> OneWayMethod<Req> {
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.method
    }

    pub async fn call(&self, request: Req) -> Result<()> {
        let message = self.method.request_message(&request)?;
        self.call.fire_and_forget(message).await
    }
}

/// Handle for a request-response method.
#[derive(Debug)]
pub struct RequestResponseMethod<Req, Resp> {
    method: MethodDescriptor,
    call: ServiceCall,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> RequestResponseMethod<Req, Resp> {
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.method
    }

    pub async fn call(&self, request: Req) -> Result<Resp> {
        let message = self.method.request_message(&request)?;
        self.call.request_response_as::<Resp>(message).await
    }
}

/// Handle for a request-stream method.
#[derive(Debug)]
pub struct RequestStreamMethod<Req, Resp> {
    method: MethodDescriptor,
    call: ServiceCall,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> RequestStreamMethod<Req, Resp> {
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.method
    }

    pub async fn call(&self, request: Req) -> Result<ResponseStream<Resp>> {
        let message = self.method.request_message(&request)?;
        self.call.request_stream_as::<Resp>(message).await
    }
}

/// Handle that sends prebuilt envelopes.
///
/// The envelope's qualifier is replaced by the method's, headers and
/// payload are sent as they are.
#[derive(Debug, Clone)]
pub struct RawMethod {
    method: MethodDescriptor,
    call: ServiceCall,
}

impl RawMethod {
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.method
    }

    pub async fn call(&self, message: ServiceMessage) -> Result<Exchange> {
        let message = message.with_qualifier(self.method.qualifier().clone());
        self.call.invoke(message, self.method.mode()).await
    }
}
