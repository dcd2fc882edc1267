//! Shared fixtures for the delivery integration tests.
#![allow(dead_code)]

pub mod mock_server;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use volley_common::Domain;
use volley_delivery::{DeliveryEndpoint, Resolve, ResolveError};

/// An in-memory DNS zone.
///
/// Domains without an entry answer NXDOMAIN.
#[derive(Default)]
pub struct StaticZone {
    mx: HashMap<String, Result<Vec<DeliveryEndpoint>, ResolveError>>,
    addresses: HashMap<String, bool>,
    lookups: AtomicUsize,
}

impl StaticZone {
    pub fn new() -> Self {
        Self::default()
    }

    /// `domain` has a single MX pointing at the local mock server on `port`.
    #[must_use]
    pub fn with_local_mx(self, domain: &str, port: u16) -> Self {
        self.with_mx(domain, vec![DeliveryEndpoint::new("127.0.0.1", 10, port)])
    }

    #[must_use]
    pub fn with_mx(mut self, domain: &str, endpoints: Vec<DeliveryEndpoint>) -> Self {
        self.mx.insert(domain.to_string(), Ok(endpoints));
        self.addresses.insert(domain.to_string(), true);
        self
    }

    #[must_use]
    pub fn with_error(mut self, domain: &str, error: ResolveError) -> Self {
        self.mx.insert(domain.to_string(), Err(error));
        self
    }

    /// Number of MX lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Resolve for StaticZone {
    async fn mail_exchangers(
        &self,
        domain: &Domain,
    ) -> Result<Vec<DeliveryEndpoint>, ResolveError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.mx
            .get(domain.as_str())
            .cloned()
            .unwrap_or_else(|| Err(ResolveError::DomainNotFound(domain.to_string())))
    }

    async fn has_address_records(&self, domain: &Domain) -> Result<bool, ResolveError> {
        match self.addresses.get(domain.as_str()) {
            Some(present) => Ok(*present),
            None if self.mx.contains_key(domain.as_str()) => Ok(false),
            None => Err(ResolveError::DomainNotFound(domain.to_string())),
        }
    }
}
