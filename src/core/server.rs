//! Server-side request engine: boundary validation, host selection and
//! endpoint dispatch for one decoded request.
//!
//! Protocol/validation rejections (missing host, unsupported version,
//! unacceptable expectation) map to terminal status codes before any
//! endpoint dispatch is attempted. Routing and matching failures recover
//! locally into well-defined terminal responses; they are never surfaced as
//! errors to the byte-level transport.
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode, Version, header};
use uuid::Uuid;

use crate::core::{
    resolver::ResolvedRequest,
    routing::RoutingTable,
};

/// Dispatches decoded requests through the routing table.
///
/// Cheap to clone; the table is shared and read-only at serving time.
#[derive(Clone, Debug)]
pub struct ServerEngine {
    table: Arc<RoutingTable>,
}

impl ServerEngine {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Handle one decoded request. `sni_name` is the TLS server name when
    /// the connection negotiated one; it takes precedence over the Host
    /// header for host selection.
    pub async fn handle(&self, req: Request<Bytes>, sni_name: Option<&str>) -> Response<Bytes> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "server_request",
            request.id = %request_id,
            http.method = %req.method(),
            http.path = req.uri().path(),
            http.status_code = tracing::field::Empty,
        );

        let response =
            tracing::Instrument::instrument(self.handle_validated(req, sni_name), span.clone())
                .await;
        span.record("http.status_code", response.status().as_u16());
        response
    }

    async fn handle_validated(
        &self,
        req: Request<Bytes>,
        sni_name: Option<&str>,
    ) -> Response<Bytes> {
        match req.version() {
            Version::HTTP_10 | Version::HTTP_11 | Version::HTTP_2 => {}
            _ => {
                return reject(
                    StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                    "unsupported HTTP version",
                );
            }
        }

        let header_host = req
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let authority_host = req.uri().authority().map(|a| a.host().to_string());

        let declared_host = sni_name
            .map(str::to_string)
            .or(header_host)
            .or(authority_host);

        // HTTP/1.1 requires host information; rejected before any dispatch.
        if declared_host.is_none() && req.version() == Version::HTTP_11 {
            return reject(StatusCode::BAD_REQUEST, "missing required Host header");
        }

        if let Some(expect) = req.headers().get(header::EXPECT) {
            let acceptable = expect
                .to_str()
                .map(|value| value.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false);
            if !acceptable {
                return reject(StatusCode::EXPECTATION_FAILED, "unacceptable expectation");
            }
        }

        let host = self.table.select(declared_host.as_deref());
        let (head, body) = req.into_parts();
        let content_type = head
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let Some(matched) = host.resolve(head.uri.path(), &head.method, content_type.as_deref())
        else {
            tracing::debug!(host = host.primary_name(), path = head.uri.path(), "No endpoint matched");
            return host.unmatched_response();
        };

        let resolver = host
            .resolver(matched.resolver_index)
            .expect("resolved index is in range");
        if let Some(endpoint) = resolver.endpoint(matched.endpoint_index)
            && let Err(status) = endpoint.apply_filters(&head)
        {
            return reject(status, "rejected by endpoint filter");
        }

        let resolved = ResolvedRequest {
            head,
            body,
            params: matched.params,
        };

        match resolver.dispatch(resolved).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Dispatcher failed");
                reject(StatusCode::INTERNAL_SERVER_ERROR, "dispatch failed")
            }
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Bytes::from(reason.to_string()))
        .unwrap_or_else(|_| Response::new(Bytes::new()))
}
