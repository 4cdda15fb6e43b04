//! Shared constants used across the application

/// Outbound user messages allowed per window without a premium entitlement.
pub const FREE_LIMIT: u32 = 10;

/// Length of the rolling quota window in milliseconds (24 hours).
pub const WINDOW_MS: i64 = 86_400_000;

/// Model requested when the config does not name one.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

pub const DEFAULT_MAX_TOKENS: u32 = 500;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Substituted when the backend answers with an empty completion.
pub const EMPTY_COMPLETION_FALLBACK: &str = "Sorry, I could not generate a response.";

/// Assistant turn appended when a send fails.
pub const BACKEND_FAILURE_APOLOGY: &str = "Sorry, I encountered an error. Please try again.";

pub const QUOTA_EXCEEDED_BANNER: &str =
    "Daily message limit reached. Upgrade to Premium for unlimited messages!";

// Key-value store keys
pub const KEY_MESSAGE_COUNT: &str = "message_count";
pub const KEY_LAST_RESET: &str = "last_reset";
pub const KEY_ONBOARDING_COMPLETED: &str = "onboarding_completed";
pub const KEY_PREMIUM_ACTIVE: &str = "premium_active";
pub const KEY_CUSTOM_COACHES: &str = "custom_coaches";
