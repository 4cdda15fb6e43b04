//! Process-level state: catalog, entitlement, quota and onboarding.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::chat::ChatSession;
use crate::core::clock::Clock;
use crate::core::config::Config;
use crate::core::constants::KEY_ONBOARDING_COMPLETED;
use crate::core::entitlement::{refresh_entitlement, EntitlementError, EntitlementProvider, Offer};
use crate::core::persona::{
    load_custom_personas, save_custom_persona, CustomPersonaDraft, Persona, PersonaCatalog,
    PersonaError,
};
use crate::core::quota::{remaining, QuotaGate, QuotaState, SharedQuotaGate};
use crate::core::store::{KeyValueStore, StoreError};

#[derive(Debug)]
pub enum AppError {
    UnknownPersona(String),
    /// A premium persona was requested without an active entitlement.
    PersonaLocked(String),
    PremiumRequired(&'static str),
    Persona(PersonaError),
    Entitlement(EntitlementError),
    Store(StoreError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::UnknownPersona(id) => write!(f, "No coach with id '{id}'"),
            AppError::PersonaLocked(id) => {
                write!(f, "Coach '{id}' requires Premium. Run `coachai upgrade` to unlock it.")
            }
            AppError::PremiumRequired(feature) => {
                write!(f, "{feature} requires Premium. Run `coachai upgrade` to unlock it.")
            }
            AppError::Persona(err) => write!(f, "{err}"),
            AppError::Entitlement(err) => write!(f, "{err}"),
            AppError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            AppError::Persona(err) => Some(err),
            AppError::Entitlement(err) => Some(err),
            AppError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PersonaError> for AppError {
    fn from(err: PersonaError) -> Self {
        AppError::Persona(err)
    }
}

impl From<EntitlementError> for AppError {
    fn from(err: EntitlementError) -> Self {
        AppError::Entitlement(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub state: QuotaState,
    pub is_premium: bool,
    /// `None` when unlimited.
    pub remaining: Option<u32>,
}

pub struct App {
    config: Config,
    store: Arc<dyn KeyValueStore>,
    entitlements: Arc<dyn EntitlementProvider>,
    clock: Arc<dyn Clock>,
    quota: SharedQuotaGate,
    catalog: PersonaCatalog,
    onboarding_completed: bool,
    is_premium: bool,
}

impl App {
    /// Startup sequence: onboarding flag, entitlement, quota window, catalog.
    pub async fn bootstrap(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        entitlements: Arc<dyn EntitlementProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let onboarding_completed = match store.get(KEY_ONBOARDING_COMPLETED) {
            Ok(value) => value.is_some_and(|value| value == "true"),
            Err(err) => {
                warn!(error = %err, "Failed to read onboarding flag; showing onboarding again");
                false
            }
        };

        let is_premium = refresh_entitlement(entitlements.as_ref()).await.premium_active;

        let quota = SharedQuotaGate::new(QuotaGate::new(store.clone(), clock.clone()));
        let state = quota.snapshot().await;

        let catalog =
            PersonaCatalog::builtin()?.with_custom(load_custom_personas(store.as_ref()));

        debug!(
            onboarding_completed,
            is_premium,
            quota_count = state.count,
            coaches = catalog.len(),
            "Application initialised"
        );

        Ok(Self {
            config,
            store,
            entitlements,
            clock,
            quota,
            catalog,
            onboarding_completed,
            is_premium,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &PersonaCatalog {
        &self.catalog
    }

    pub fn quota(&self) -> &SharedQuotaGate {
        &self.quota
    }

    pub fn is_premium(&self) -> bool {
        self.is_premium
    }

    pub fn onboarding_completed(&self) -> bool {
        self.onboarding_completed
    }

    pub fn complete_onboarding(&mut self) -> Result<(), AppError> {
        self.store.set(KEY_ONBOARDING_COMPLETED, "true")?;
        self.onboarding_completed = true;
        Ok(())
    }

    pub async fn upgrade(&mut self, offer: Offer) -> Result<bool, AppError> {
        let active = self.entitlements.purchase(offer).await?;
        if active {
            info!(offer = offer.label(), "Premium entitlement activated");
            self.is_premium = true;
        }
        Ok(active)
    }

    pub async fn restore(&mut self) -> Result<bool, AppError> {
        let restored = self.entitlements.restore().await?;
        if restored {
            self.is_premium = true;
        }
        Ok(restored)
    }

    pub async fn quota_status(&self) -> QuotaStatus {
        let state = self.quota.snapshot().await;
        QuotaStatus {
            state,
            is_premium: self.is_premium,
            remaining: remaining(&state, self.is_premium),
        }
    }

    /// Open a conversation with `persona_id`. `user_context` overrides the
    /// configured one when given.
    pub fn start_conversation(
        &self,
        persona_id: &str,
        user_context: Option<String>,
    ) -> Result<ChatSession, AppError> {
        let persona = self
            .catalog
            .find(persona_id)
            .ok_or_else(|| AppError::UnknownPersona(persona_id.to_string()))?;
        if !persona.is_accessible(self.is_premium) {
            return Err(AppError::PersonaLocked(persona_id.to_string()));
        }
        let context = user_context.or_else(|| self.config.user_context.clone());
        Ok(ChatSession::new(persona.clone(), context, self.clock.clone()))
    }

    /// Create and save a custom coach. Premium only.
    pub fn create_custom_persona(&mut self, draft: CustomPersonaDraft) -> Result<Persona, AppError> {
        if !self.is_premium {
            return Err(AppError::PremiumRequired("Creating custom coaches"));
        }
        let persona = draft.into_persona(self.clock.now_ms())?;
        save_custom_persona(self.store.as_ref(), persona.clone())?;
        self.catalog = self.catalog.clone().with_custom(vec![persona.clone()]);
        info!(id = %persona.id, "Custom coach created");
        Ok(persona)
    }
}
