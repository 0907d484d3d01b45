//! Request gate: everything except `/updateCluster` requires a bootstrapped
//! cluster.

use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, ResponseError};
use futures_util::future::LocalBoxFuture;

use crate::errors::ApiError;
use crate::server::ChatServer;

/// Middleware factory rejecting pre-bootstrap traffic.
pub struct ClusterGuard {
    server: Arc<ChatServer>,
}

impl ClusterGuard {
    pub fn new(server: Arc<ChatServer>) -> Self {
        Self { server }
    }
}

impl<S> Transform<S, ServiceRequest> for ClusterGuard
where
    S: Service<ServiceRequest, Response = ServiceResponse, Error = Error> + 'static,
    S::Future: 'static,
{
    type Response = ServiceResponse;
    type Error = Error;
    type InitError = ();
    type Transform = ClusterGuardService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ClusterGuardService {
            service: Rc::new(service),
            server: Arc::clone(&self.server),
        }))
    }
}

pub struct ClusterGuardService<S> {
    service: Rc<S>,
    server: Arc<ChatServer>,
}

impl<S> Service<ServiceRequest> for ClusterGuardService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse, Error = Error> + 'static,
    S::Future: 'static,
{
    type Response = ServiceResponse;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if req.path() != "/updateCluster" && !self.server.cluster_started() {
            let response = ApiError::ClusterNotStarted.error_response();
            return Box::pin(async move { Ok(req.into_response(response)) });
        }
        let service = Rc::clone(&self.service);
        Box::pin(async move { service.call(req).await })
    }
}
