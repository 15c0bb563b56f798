//! Service descriptors
//!
//! A [`ServiceDescriptor`] is the explicit, statically built description of
//! one service: its name and, per method, the qualifier, communication mode
//! and request/response element types. Every other layer (registry, client
//! stubs, dispatch table) works from descriptors instead of inspecting types
//! at runtime.
//!
//! # Example
//!
//! ```
//! use meshrpc_common::descriptor::ServiceDescriptor;
//!
//! let greeting = ServiceDescriptor::builder("io.example.Greeting")
//!     .request_response::<String, String>("greeting")
//!     .request_stream::<u32, String>("many")
//!     .fire_and_forget("ping")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(greeting.methods().count(), 3);
//! assert_eq!(
//!     greeting.method("greeting").unwrap().qualifier().to_string(),
//!     "io.example.Greeting/greeting"
//! );
//! ```

use crate::protocol::{CommunicationMode, MeshError, Qualifier, Result, ServiceMessage};
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// Identifies a request or response element type.
///
/// Tags compare by name. `()` is [`TypeTag::UNIT`], the envelope type
/// [`ServiceMessage`] is [`TypeTag::DYNAMIC`] (payload left untyped).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(Cow<'static, str>);

impl TypeTag {
    pub const UNIT: TypeTag = TypeTag(Cow::Borrowed("()"));
    pub const DYNAMIC: TypeTag = TypeTag(Cow::Borrowed("*"));

    /// Tag for the Rust type `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        let id = TypeId::of::<T>();
        if id == TypeId::of::<()>() {
            Self::UNIT
        } else if id == TypeId::of::<ServiceMessage>() {
            Self::DYNAMIC
        } else {
            TypeTag(Cow::Borrowed(std::any::type_name::<T>()))
        }
    }

    /// Tag with an explicit name, for overrides and foreign type names.
    pub fn named(name: impl Into<String>) -> Self {
        TypeTag(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unit(&self) -> bool {
        *self == Self::UNIT
    }

    pub fn is_dynamic(&self) -> bool {
        *self == Self::DYNAMIC
    }

    /// Whether a caller using `other` may talk to a method declared with `self`.
    pub fn accepts(&self, other: &TypeTag) -> bool {
        self == other || self.is_dynamic() || other.is_dynamic()
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Description of one service method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    qualifier: Qualifier,
    mode: CommunicationMode,
    /// Declared parameter type; `()` when the method takes no argument.
    parameter_type: TypeTag,
    /// Element type the payload is decoded into.
    request_type: TypeTag,
    /// Element type of the single response or of each stream item.
    response_type: TypeTag,
}

impl MethodDescriptor {
    /// Describes a method taking `Req` and answering with `Resp` elements.
    ///
    /// Fails with a definition error when the mode cannot carry that shape:
    /// fire-and-forget takes and returns nothing, one-way takes exactly one
    /// argument and returns nothing.
    pub fn new<Req: ?Sized + 'static, Resp: ?Sized + 'static>(
        qualifier: Qualifier,
        mode: CommunicationMode,
    ) -> Result<Self> {
        Self::from_tags(qualifier, mode, TypeTag::of::<Req>(), TypeTag::of::<Resp>())
    }

    pub fn from_tags(
        qualifier: Qualifier,
        mode: CommunicationMode,
        parameter_type: TypeTag,
        response_type: TypeTag,
    ) -> Result<Self> {
        match mode {
            CommunicationMode::FireAndForget => {
                if !parameter_type.is_unit() || !response_type.is_unit() {
                    return Err(MeshError::Definition(format!(
                        "{}: fire-and-forget methods take no argument and return nothing",
                        qualifier
                    )));
                }
            }
            CommunicationMode::OneWay => {
                if parameter_type.is_unit() {
                    return Err(MeshError::Definition(format!(
                        "{}: one-way methods take exactly one argument",
                        qualifier
                    )));
                }
                if !response_type.is_unit() {
                    return Err(MeshError::Definition(format!(
                        "{}: one-way methods return nothing",
                        qualifier
                    )));
                }
            }
            CommunicationMode::RequestResponse | CommunicationMode::RequestStream => {}
        }

        let request_type = parameter_type.clone();
        Ok(Self {
            qualifier,
            mode,
            parameter_type,
            request_type,
            response_type,
        })
    }

    /// Overrides the element type the payload is decoded into.
    pub fn with_request_type(mut self, request_type: TypeTag) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn qualifier(&self) -> &Qualifier {
        &self.qualifier
    }

    pub fn method_name(&self) -> &str {
        self.qualifier.method()
    }

    pub fn mode(&self) -> CommunicationMode {
        self.mode
    }

    pub fn parameter_type(&self) -> &TypeTag {
        &self.parameter_type
    }

    pub fn request_type(&self) -> &TypeTag {
        &self.request_type
    }

    pub fn response_type(&self) -> &TypeTag {
        &self.response_type
    }

    /// Whether the method takes an argument at all.
    pub fn takes_argument(&self) -> bool {
        !self.parameter_type.is_unit()
    }

    /// Builds the request message for one call.
    ///
    /// No argument gives an empty payload; anything else becomes the
    /// payload. Callers that already hold a [`ServiceMessage`] send it
    /// as is instead.
    pub fn request_message<Req: Serialize + ?Sized>(&self, request: &Req) -> Result<ServiceMessage> {
        let message = ServiceMessage::new(self.qualifier.clone());
        if !self.takes_argument() {
            return Ok(message);
        }
        message.with_data(request)
    }
}

/// Description of a whole service: its name and its methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    name: String,
    methods: BTreeMap<String, MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn builder(name: impl Into<String>) -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Methods ordered by method name.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }

    pub fn method(&self, method_name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method_name)
    }

    pub fn method_by_qualifier(&self, qualifier: &Qualifier) -> Option<&MethodDescriptor> {
        if qualifier.service() != self.name {
            return None;
        }
        self.methods.get(qualifier.method())
    }

    pub fn qualifiers(&self) -> impl Iterator<Item = &Qualifier> {
        self.methods.values().map(MethodDescriptor::qualifier)
    }
}

/// Builder for [`ServiceDescriptor`].
///
/// Errors are collected and reported by [`build`](Self::build), so a
/// malformed service fails once, at registration time.
pub struct ServiceDescriptorBuilder {
    name: String,
    methods: Vec<PendingMethod>,
    overrides: Vec<(String, TypeTag)>,
}

struct PendingMethod {
    name: String,
    mode: CommunicationMode,
    parameter_type: TypeTag,
    response_type: TypeTag,
}

impl ServiceDescriptorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            overrides: Vec::new(),
        }
    }

    /// Adds a method with explicit mode and element types.
    pub fn method<Req: ?Sized + 'static, Resp: ?Sized + 'static>(
        self,
        name: impl Into<String>,
        mode: CommunicationMode,
    ) -> Self {
        self.method_with_tags(name, mode, TypeTag::of::<Req>(), TypeTag::of::<Resp>())
    }

    pub fn method_with_tags(
        mut self,
        name: impl Into<String>,
        mode: CommunicationMode,
        parameter_type: TypeTag,
        response_type: TypeTag,
    ) -> Self {
        self.methods.push(PendingMethod {
            name: name.into(),
            mode,
            parameter_type,
            response_type,
        });
        self
    }

    pub fn fire_and_forget(self, name: impl Into<String>) -> Self {
        self.method::<(), ()>(name, CommunicationMode::FireAndForget)
    }

    pub fn one_way<Req: ?Sized + 'static>(self, name: impl Into<String>) -> Self {
        self.method::<Req, ()>(name, CommunicationMode::OneWay)
    }

    pub fn request_response<Req: ?Sized + 'static, Resp: ?Sized + 'static>(
        self,
        name: impl Into<String>,
    ) -> Self {
        self.method::<Req, Resp>(name, CommunicationMode::RequestResponse)
    }

    pub fn request_stream<Req: ?Sized + 'static, Resp: ?Sized + 'static>(
        self,
        name: impl Into<String>,
    ) -> Self {
        self.method::<Req, Resp>(name, CommunicationMode::RequestStream)
    }

    /// Overrides the decoded request type of an already declared method.
    pub fn request_type(mut self, method_name: impl Into<String>, tag: TypeTag) -> Self {
        self.overrides.push((method_name.into(), tag));
        self
    }

    pub fn build(self) -> Result<ServiceDescriptor> {
        if self.name.is_empty() {
            return Err(MeshError::Definition("service name must not be empty".into()));
        }

        let mut methods = BTreeMap::new();
        for pending in self.methods {
            let qualifier = Qualifier::new(self.name.clone(), pending.name.clone())
                .map_err(|e| MeshError::Definition(e.to_string()))?;
            let descriptor = MethodDescriptor::from_tags(
                qualifier,
                pending.mode,
                pending.parameter_type,
                pending.response_type,
            )?;
            if methods.insert(pending.name.clone(), descriptor).is_some() {
                return Err(MeshError::Definition(format!(
                    "{}: method '{}' declared twice",
                    self.name, pending.name
                )));
            }
        }

        for (method_name, tag) in self.overrides {
            let method = methods.remove(&method_name).ok_or_else(|| {
                MeshError::Definition(format!(
                    "{}: request type override for unknown method '{}'",
                    self.name, method_name
                ))
            })?;
            methods.insert(method_name, method.with_request_type(tag));
        }

        Ok(ServiceDescriptor {
            name: self.name,
            methods,
        })
    }
}
