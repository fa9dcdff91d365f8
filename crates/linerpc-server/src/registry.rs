//! Service registry: descriptor tables and typed dispatch.
//!
//! Rust has no runtime method discovery, so services are registered as
//! explicit descriptor tables: [`Service`] is a builder mapping method
//! names to type-erased callables. The typed wrapper around each handler
//! decodes the raw parameter payload into the handler's argument record
//! (classifying failure as `InvalidParams`), invokes the handler, and
//! serializes the reply, so the registry itself never needs to know any
//! handler types.
//!
//! Dispatch is read-mostly: the registry map sits behind a readers-writer
//! lock that the hot path holds only long enough to snapshot the service
//! entry.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::{to_raw_value, RawValue};
use serde_json::json;

use linerpc_common::{Context, Error, ErrorObject, Result};

/// Outcome of a dispatch: a raw reply payload, or the wire-level error the
/// response should carry.
pub type DispatchResult = std::result::Result<Box<RawValue>, ErrorObject>;

/// Type-erased, immutable per-method descriptor. Built once at
/// registration, consulted per call without further inspection.
trait MethodHandler: Send + Sync + 'static {
    fn invoke(&self, ctx: Context, params: Option<Box<RawValue>>)
        -> BoxFuture<'static, DispatchResult>;
}

/// The typed wrapper generated for each registered method.
struct TypedMethod<A, R> {
    handler: Arc<dyn Fn(Context, A) -> BoxFuture<'static, Result<R>> + Send + Sync>,
}

impl<A, R> MethodHandler for TypedMethod<A, R>
where
    A: DeserializeOwned + Default + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn invoke(
        &self,
        ctx: Context,
        params: Option<Box<RawValue>>,
    ) -> BoxFuture<'static, DispatchResult> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            // Absent params decode to the argument record's default, the
            // same way an empty JSON body would.
            let args: A = match params {
                Some(raw) => serde_json::from_str(raw.get()).map_err(|err| {
                    ErrorObject::invalid_params(format!("failed to decode args: {err}"))
                })?,
                None => A::default(),
            };

            let outcome = AssertUnwindSafe(async move { (handler)(ctx, args).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(reply)) => to_raw_value(&reply).map_err(|err| {
                    ErrorObject::internal_error(format!("failed to encode reply: {err}"))
                }),
                // Handlers may return a typed wire error; everything else
                // is wrapped as Internal.
                Ok(Err(Error::Rpc(obj))) => Err(obj),
                Ok(Err(err)) => Err(ErrorObject::internal_error(err.to_string())),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(panic = %message, "handler panicked");
                    Err(ErrorObject::internal_error("handler panicked")
                        .with_data(json!({ "panic": message })))
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A service descriptor under construction: a name plus a method table.
///
/// Method names must begin with an upper-case letter; others are skipped
/// with a warning, mirroring the convention that only exported methods are
/// callable. A service whose table ends up empty fails registration.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Create a descriptor named after `T`: the last path segment of the
    /// type name. Registration under the derived name still requires it to
    /// start with an upper-case letter.
    pub fn of_type<T>() -> Self {
        let name = std::any::type_name::<T>()
            .rsplit("::")
            .next()
            .unwrap_or_default();
        Self::new(name)
    }

    /// Add a typed method. The handler is an async function from its
    /// argument record to its reply record; decoding and encoding are
    /// handled by the generated wrapper.
    pub fn method<A, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Default + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        if !is_exported(name) {
            tracing::warn!(
                service = %self.name,
                method = name,
                "skipping method: name must start with an upper-case letter"
            );
            return self;
        }

        let handler = Arc::new(handler);
        let boxed: Arc<dyn Fn(Context, A) -> BoxFuture<'static, Result<R>> + Send + Sync> =
            Arc::new(move |ctx, args| Box::pin((handler)(ctx, args)));
        self.methods
            .insert(name.to_string(), Arc::new(TypedMethod { handler: boxed }));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of methods that passed the eligibility check.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

struct ServiceEntry {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

/// Maps service names to their method tables and dispatches calls.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a service under its declared name. The name must start
    /// with an upper-case letter.
    pub fn register(&self, service: Service) -> Result<()> {
        let name = service.name.clone();
        self.register_as(name, service, false)
    }

    /// Register a service under an explicit name, bypassing the
    /// upper-case convention check.
    pub fn register_named(&self, name: impl Into<String>, service: Service) -> Result<()> {
        self.register_as(name.into(), service, true)
    }

    fn register_as(&self, name: String, service: Service, explicit: bool) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Registration("service name is required".into()));
        }
        if !explicit && !is_exported(&name) {
            return Err(Error::Registration(format!(
                "service name {name:?} must start with an upper-case letter"
            )));
        }
        if service.methods.is_empty() {
            return Err(Error::Registration(format!(
                "service {name} has no methods of suitable shape"
            )));
        }

        let mut services = self.services.write().expect("registry lock poisoned");
        if services.contains_key(&name) {
            return Err(Error::Registration(format!(
                "service {name} already registered"
            )));
        }
        services.insert(
            name,
            Arc::new(ServiceEntry {
                methods: service.methods,
            }),
        );
        Ok(())
    }

    /// Dispatch a call. Unknown services and methods come back as
    /// `MethodNotFound`; everything the handler can produce is mapped by
    /// its typed wrapper.
    pub async fn call(
        &self,
        ctx: Context,
        service: &str,
        method: &str,
        params: Option<Box<RawValue>>,
    ) -> DispatchResult {
        let entry = {
            let services = self.services.read().expect("registry lock poisoned");
            services.get(service).cloned()
        };
        let Some(entry) = entry else {
            return Err(ErrorObject::method_not_found(format!(
                "service {service} not found"
            )));
        };
        let Some(handler) = entry.methods.get(method) else {
            return Err(ErrorObject::method_not_found(format!("{service}.{method}")));
        };
        handler.invoke(ctx, params).await
    }

    /// Method names of a registered service, for introspection.
    pub fn service_methods(&self, name: &str) -> Option<Vec<String>> {
        let services = self.services.read().expect("registry lock poisoned");
        services
            .get(name)
            .map(|entry| entry.methods.keys().cloned().collect())
    }

    /// Names of every registered service.
    pub fn list_services(&self) -> Vec<String> {
        let services = self.services.read().expect("registry lock poisoned");
        services.keys().cloned().collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use linerpc_common::protocol::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
    use serde::Deserialize;

    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[derive(Serialize)]
    struct AddReply {
        result: i64,
    }

    fn calculator() -> Service {
        Service::new("Calculator")
            .method("Add", |_ctx, args: AddArgs| async move {
                Ok(AddReply {
                    result: args.a + args.b,
                })
            })
            .method("Fail", |_ctx, _args: AddArgs| async move {
                Err::<AddReply, _>(Error::InvalidInput("intentional failure".into()))
            })
            .method("Panic", |_ctx, _args: AddArgs| async move { boom() })
    }

    fn boom() -> Result<AddReply> {
        panic!("boom")
    }

    fn raw(value: serde_json::Value) -> Option<Box<RawValue>> {
        Some(to_raw_value(&value).unwrap())
    }

    #[test]
    fn test_register_validations() {
        let registry = ServiceRegistry::new();

        // Empty name
        let err = registry.register(Service::new("")).unwrap_err();
        assert!(matches!(err, Error::Registration(_)));

        // Lower-case declared name
        let svc = Service::new("calculator").method("Add", |_ctx, args: AddArgs| async move {
            Ok(AddReply {
                result: args.a + args.b,
            })
        });
        assert!(registry.register(svc).is_err());

        // Same service is fine under an explicit name
        let svc = Service::new("calculator").method("Add", |_ctx, args: AddArgs| async move {
            Ok(AddReply {
                result: args.a + args.b,
            })
        });
        registry.register_named("calc", svc).unwrap();

        // No eligible methods
        let err = registry.register(Service::new("Empty")).unwrap_err();
        assert!(matches!(err, Error::Registration(_)));

        // Duplicate
        registry.register(calculator()).unwrap();
        let err = registry.register(calculator()).unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
    }

    #[test]
    fn test_of_type_derives_service_name() {
        struct Arithmetic;

        let svc = Service::of_type::<Arithmetic>().method("Add", |_ctx, args: AddArgs| async move {
            Ok(AddReply {
                result: args.a + args.b,
            })
        });
        assert_eq!(svc.name(), "Arithmetic");

        let registry = ServiceRegistry::new();
        registry.register(svc).unwrap();
        assert_eq!(registry.list_services(), vec!["Arithmetic".to_string()]);
    }

    #[test]
    fn test_lowercase_methods_are_skipped() {
        let svc = Service::new("Svc")
            .method("Visible", |_ctx, _: AddArgs| async move {
                Ok(AddReply { result: 0 })
            })
            .method("hidden", |_ctx, _: AddArgs| async move {
                Ok(AddReply { result: 0 })
            });
        assert_eq!(svc.method_count(), 1);
    }

    #[test]
    fn test_introspection() {
        let registry = ServiceRegistry::new();
        registry.register(calculator()).unwrap();

        assert_eq!(registry.list_services(), vec!["Calculator".to_string()]);
        let mut methods = registry.service_methods("Calculator").unwrap();
        methods.sort();
        assert_eq!(methods, vec!["Add", "Fail", "Panic"]);
        assert!(registry.service_methods("Nope").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let registry = ServiceRegistry::new();
        registry.register(calculator()).unwrap();

        let result = registry
            .call(
                Context::background(),
                "Calculator",
                "Add",
                raw(json!({"a": 10, "b": 20})),
            )
            .await
            .unwrap();
        assert_eq!(result.get(), r#"{"result":30}"#);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_service() {
        let registry = ServiceRegistry::new();
        registry.register(calculator()).unwrap();

        let err = registry
            .call(Context::background(), "Missing", "Add", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let registry = ServiceRegistry::new();
        registry.register(calculator()).unwrap();

        let err = registry
            .call(Context::background(), "Calculator", "Missing", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dispatch_invalid_params() {
        let registry = ServiceRegistry::new();
        registry.register(calculator()).unwrap();

        let err = registry
            .call(
                Context::background(),
                "Calculator",
                "Add",
                raw(json!({"a": "not a number"})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_dispatch_absent_params_defaults() {
        let registry = ServiceRegistry::new();
        registry.register(calculator()).unwrap();

        let result = registry
            .call(Context::background(), "Calculator", "Add", None)
            .await
            .unwrap();
        assert_eq!(result.get(), r#"{"result":0}"#);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_internal() {
        let registry = ServiceRegistry::new();
        registry.register(calculator()).unwrap();

        let err = registry
            .call(Context::background(), "Calculator", "Fail", raw(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert!(err.data.unwrap().to_string().contains("intentional failure"));
    }

    #[tokio::test]
    async fn test_handler_rpc_error_passes_through() {
        let svc = Service::new("Svc").method("Teapot", |_ctx, _: AddArgs| async move {
            Err::<AddReply, _>(Error::Rpc(ErrorObject::new(-32000, "teapot")))
        });
        let registry = ServiceRegistry::new();
        registry.register(svc).unwrap();

        let err = registry
            .call(Context::background(), "Svc", "Teapot", raw(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "teapot");
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal() {
        let registry = ServiceRegistry::new();
        registry.register(calculator()).unwrap();

        let err = registry
            .call(Context::background(), "Calculator", "Panic", raw(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code, INTERNAL_ERROR);
        let data = err.data.unwrap();
        assert!(data["panic"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_concurrent_dispatch() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(calculator()).unwrap();

        let mut handles = Vec::new();
        for i in 0..50i64 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let result = registry
                    .call(
                        Context::background(),
                        "Calculator",
                        "Add",
                        raw(json!({"a": i, "b": 1})),
                    )
                    .await
                    .unwrap();
                let value: serde_json::Value = serde_json::from_str(result.get()).unwrap();
                assert_eq!(value["result"], json!(i + 1));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
