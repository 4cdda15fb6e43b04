//! Premium entitlement as reported by a subscription provider.
//!
//! The core never decides entitlement on its own; it asks an
//! [`EntitlementProvider`]. [`SandboxEntitlements`] stands in for a real
//! billing SDK: purchases always succeed and the flag is kept in the store.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::constants::KEY_PREMIUM_ACTIVE;
use crate::core::store::{KeyValueStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntitlementState {
    pub premium_active: bool,
}

/// Purchasable subscription plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Monthly,
    Annual,
}

impl Offer {
    pub fn label(self) -> &'static str {
        match self {
            Offer::Monthly => "Monthly",
            Offer::Annual => "Annual",
        }
    }

    pub fn price(self) -> &'static str {
        match self {
            Offer::Monthly => "$9.99/month",
            Offer::Annual => "$79.99/year",
        }
    }
}

#[derive(Debug)]
pub enum EntitlementError {
    /// The provider is not configured (missing key, not initialised).
    Unavailable(String),
    /// The user backed out of the purchase sheet.
    Cancelled,
    Store(StoreError),
}

impl fmt::Display for EntitlementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntitlementError::Unavailable(reason) => {
                write!(f, "Subscription service unavailable: {reason}")
            }
            EntitlementError::Cancelled => write!(f, "Purchase cancelled"),
            EntitlementError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl StdError for EntitlementError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            EntitlementError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for EntitlementError {
    fn from(err: StoreError) -> Self {
        EntitlementError::Store(err)
    }
}

#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    async fn customer_status(&self) -> Result<EntitlementState, EntitlementError>;

    /// Returns whether the premium entitlement is active afterwards.
    async fn purchase(&self, offer: Offer) -> Result<bool, EntitlementError>;

    /// Returns whether a previous purchase was found.
    async fn restore(&self) -> Result<bool, EntitlementError>;
}

/// Ask the provider for the current state, treating any failure as
/// non-premium.
pub async fn refresh_entitlement(provider: &dyn EntitlementProvider) -> EntitlementState {
    match provider.customer_status().await {
        Ok(state) => state,
        Err(err) => {
            warn!(error = %err, "Error checking premium status");
            EntitlementState::default()
        }
    }
}

pub struct SandboxEntitlements {
    store: Arc<dyn KeyValueStore>,
}

impl SandboxEntitlements {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn read_flag(&self) -> Result<bool, EntitlementError> {
        Ok(self
            .store
            .get(KEY_PREMIUM_ACTIVE)?
            .is_some_and(|value| value.trim() == "true"))
    }
}

#[async_trait]
impl EntitlementProvider for SandboxEntitlements {
    async fn customer_status(&self) -> Result<EntitlementState, EntitlementError> {
        Ok(EntitlementState {
            premium_active: self.read_flag()?,
        })
    }

    async fn purchase(&self, offer: Offer) -> Result<bool, EntitlementError> {
        info!(offer = offer.label(), "Simulating purchase in sandbox mode");
        self.store.set(KEY_PREMIUM_ACTIVE, "true")?;
        Ok(true)
    }

    async fn restore(&self) -> Result<bool, EntitlementError> {
        self.read_flag()
    }
}
