//! Endpoint resolution and dispatch.
//!
//! An `EndpointResolver` is an ordered collection of endpoints sharing a
//! single dispatcher. Resolution order is stable and deterministic: the first
//! structurally matching endpoint wins, ties are broken by declaration order,
//! never by specificity scoring.
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Response, request::Parts};
use thiserror::Error;

use crate::core::endpoint::{Endpoint, PathParams};

/// Errors surfaced by a dispatcher
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// The dispatcher failed to produce a response
    #[error("Dispatch failed: {0}")]
    Failed(String),

    /// The dispatcher could not build a well-formed response
    #[error("Invalid response from dispatcher: {0}")]
    InvalidResponse(String),
}

/// Result type for dispatch operations
pub type DispatchResult = Result<Response<Bytes>, DispatchError>;

/// A resolved request handed to a dispatcher: decoded head and body plus the
/// path parameters extracted by the matched endpoint.
#[derive(Debug)]
pub struct ResolvedRequest {
    pub head: Parts,
    pub body: Bytes,
    pub params: PathParams,
}

/// The single user-supplied callback shared by all endpoints of a resolver.
/// It is expected to produce a terminal response or fail with a
/// [`DispatchError`].
pub type Dispatcher =
    Arc<dyn Fn(ResolvedRequest) -> BoxFuture<'static, DispatchResult> + Send + Sync>;

/// A resolver match: the matched endpoint's position plus extracted
/// parameters.
#[derive(Debug)]
pub struct ResolverMatch {
    pub endpoint_index: usize,
    pub params: PathParams,
}

/// An ordered group of endpoints sharing one dispatch callback.
pub struct EndpointResolver {
    endpoints: Vec<Endpoint>,
    dispatcher: Dispatcher,
}

impl EndpointResolver {
    /// Create a resolver from endpoints in declaration order and their shared
    /// dispatcher.
    pub fn new(endpoints: Vec<Endpoint>, dispatcher: Dispatcher) -> Self {
        Self {
            endpoints,
            dispatcher,
        }
    }

    /// Convenience constructor wrapping a closure-based dispatcher.
    pub fn with_dispatcher<F>(endpoints: Vec<Endpoint>, dispatcher: F) -> Self
    where
        F: Fn(ResolvedRequest) -> BoxFuture<'static, DispatchResult> + Send + Sync + 'static,
    {
        Self::new(endpoints, Arc::new(dispatcher))
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Resolve the first endpoint matching path, method and content type.
    ///
    /// Pure: no side effects until [`dispatch`](Self::dispatch) is invoked.
    pub fn resolve(
        &self,
        path: &str,
        method: &http::Method,
        content_type: Option<&str>,
    ) -> Option<ResolverMatch> {
        self.endpoints
            .iter()
            .enumerate()
            .find_map(|(endpoint_index, endpoint)| {
                endpoint
                    .matches(path, method, content_type)
                    .map(|params| ResolverMatch {
                        endpoint_index,
                        params,
                    })
            })
    }

    /// Invoke the shared dispatcher with a resolved request.
    pub async fn dispatch(&self, resolved: ResolvedRequest) -> DispatchResult {
        (self.dispatcher)(resolved).await
    }

    /// The endpoint at a previously resolved position.
    pub fn endpoint(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }
}

impl std::fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("endpoints", &self.endpoints)
            .finish()
    }
}
