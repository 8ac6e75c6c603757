//! Services map `"Service.Method"` names to invokable handlers.
//!
//! Registration captures one monomorphic closure per method that decodes the
//! argument from an erased deserializer, runs the handler, and re-erases the
//! reply for whichever codec the connection negotiated.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use erased_serde as erased;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

pub type HandlerResult = Result<Box<dyn erased::Serialize + Send + Sync>, Error>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

type MethodFn = Box<
    dyn Fn(&mut dyn erased::Deserializer<'static>) -> Result<HandlerFuture, Error> + Send + Sync,
>;

/// One registered method: its handler plus a dispatch counter.
pub struct MethodType {
    f: MethodFn,
    num_calls: AtomicU64,
}

impl MethodType {
    /// Decodes the argument and returns the handler future. Decode failures
    /// are per-call errors; the connection is unaffected.
    pub(crate) fn invoke(
        &self,
        de: &mut dyn erased::Deserializer<'static>,
    ) -> Result<HandlerFuture, Error> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.f)(de)
    }

    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }
}

/// A named set of methods. Built once, immutable afterwards.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    /// Method names with their call counts, sorted by name.
    pub fn method_stats(&self) -> Vec<(String, u64)> {
        let mut stats: Vec<_> = self
            .methods
            .iter()
            .map(|(name, m)| (name.clone(), m.num_calls()))
            .collect();
        stats.sort();
        stats
    }
}

pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl ServiceBuilder {
    /// Registers a method under `name`. The handler takes the decoded
    /// argument by value and resolves to the reply.
    pub fn method<Req, Res, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + Sync + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Error>> + Send + 'static,
    {
        let method: MethodFn = Box::new(move |de| {
            let args: Req = erased::deserialize(de)
                .map_err(|err| Error::Service(format!("rpc server: read argv failed: {}", err)))?;
            let fut = f(args);
            Ok(Box::pin(async move {
                let reply = fut.await?;
                Ok(Box::new(reply) as Box<dyn erased::Serialize + Send + Sync>)
            }))
        });

        self.methods.insert(
            name.into(),
            Arc::new(MethodType {
                f: method,
                num_calls: AtomicU64::new(0),
            }),
        );
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use bincode::Options;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    fn sum_service() -> Service {
        Service::builder("Foo")
            .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
            .build()
    }

    fn decode_with<T, F>(value: &T, f: F) -> Result<HandlerFuture, Error>
    where
        T: Serialize,
        F: FnOnce(&mut dyn erased::Deserializer<'static>) -> Result<HandlerFuture, Error>,
    {
        let payload = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .serialize(value)
            .unwrap();
        let mut de = bincode::Deserializer::with_reader(
            Cursor::new(payload),
            bincode::DefaultOptions::new().with_fixint_encoding(),
        );
        let mut de = <dyn erased::Deserializer>::erase(&mut de);
        f(&mut de)
    }

    #[tokio::test]
    async fn invoke_runs_handler_and_counts() {
        let service = sum_service();
        let method = service.method("Sum").unwrap();
        assert_eq!(method.num_calls(), 0);

        let fut = decode_with(
            &Args { num1: 2, num2: 40 },
            |de| method.invoke(de),
        )
        .unwrap();
        let reply = fut.await.unwrap();
        let encoded = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .serialize(&reply)
            .unwrap();
        let decoded: i32 = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .deserialize(&encoded)
            .unwrap();
        assert_eq!(decoded, 42);
        assert_eq!(method.num_calls(), 1);
    }

    #[tokio::test]
    async fn invoke_rejects_malformed_argv() {
        let service = sum_service();
        let method = service.method("Sum").unwrap();

        // A lone bool is not a valid `Args` payload.
        let result = decode_with(&true, |de| method.invoke(de));
        match result {
            Err(Error::Service(msg)) => assert!(msg.contains("read argv failed")),
            other => panic!("expected argv error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unknown_method_lookup() {
        let service = sum_service();
        assert!(service.method("Sum").is_some());
        assert!(service.method("Nope").is_none());
    }
}
