use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use tracing::warn;

use crate::core::constants::KEY_CUSTOM_COACHES;
use crate::core::store::{KeyValueStore, StoreError};

const BUILTIN_COACHES: &str = include_str!("../builtins/coaches.toml");

const DEFAULT_SPECIALTY: &str = "General coaching";
const DEFAULT_PERSONALITY: &str = "Supportive and helpful";
const DEFAULT_AVATAR: &str = "🤖";
const CUSTOM_SAMPLE_PROMPTS: [&str; 3] = [
    "How can you help me?",
    "What is your approach?",
    "Can you give me some advice?",
];

/// A coaching profile the user can talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub role: String,
    pub specialty: String,
    pub personality: String,
    pub avatar: String,
    #[serde(default)]
    pub is_premium: bool,
    /// Instructions sent as the system message of every request.
    pub system_prompt: String,
    #[serde(default)]
    pub sample_prompts: Vec<String>,
}

impl Persona {
    /// Premium personas are only reachable with an active entitlement.
    pub fn is_accessible(&self, is_premium: bool) -> bool {
        !self.is_premium || is_premium
    }

    pub fn is_custom(&self) -> bool {
        self.id.starts_with("custom-")
    }
}

#[derive(Debug)]
pub enum PersonaError {
    /// Catalog TOML could not be parsed.
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    DuplicateId(String),
    EmptySystemPrompt(String),
    /// A required field of a custom persona was blank.
    MissingField(&'static str),
    Store(StoreError),
}

impl fmt::Display for PersonaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersonaError::Parse(err) => write!(f, "Failed to parse coach catalog: {err}"),
            PersonaError::Serialize(err) => write!(f, "Failed to encode coaches: {err}"),
            PersonaError::DuplicateId(id) => write!(f, "Duplicate coach id '{id}'"),
            PersonaError::EmptySystemPrompt(id) => {
                write!(f, "Coach '{id}' has an empty system prompt")
            }
            PersonaError::MissingField(field) => {
                write!(f, "Please provide at least a name and role ({field} is missing)")
            }
            PersonaError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl StdError for PersonaError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            PersonaError::Parse(err) => Some(err),
            PersonaError::Serialize(err) => Some(err),
            PersonaError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for PersonaError {
    fn from(err: StoreError) -> Self {
        PersonaError::Store(err)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CoachList {
    #[serde(default)]
    coaches: Vec<Persona>,
}

/// Read-only list of personas, built-in first, then user-created.
#[derive(Debug, Clone)]
pub struct PersonaCatalog {
    personas: Vec<Persona>,
}

impl PersonaCatalog {
    /// The coaches shipped with the binary.
    pub fn builtin() -> Result<Self, PersonaError> {
        let list: CoachList = toml::from_str(BUILTIN_COACHES).map_err(PersonaError::Parse)?;
        Self::from_personas(list.coaches)
    }

    /// Build a catalog, rejecting duplicate ids and empty prompts.
    pub fn from_personas(personas: Vec<Persona>) -> Result<Self, PersonaError> {
        let mut seen = HashSet::new();
        for persona in &personas {
            check_prompt(persona)?;
            if !seen.insert(persona.id.as_str()) {
                return Err(PersonaError::DuplicateId(persona.id.clone()));
            }
        }
        Ok(Self { personas })
    }

    /// Append user-created personas, skipping any that would break the
    /// catalog invariants.
    pub fn with_custom(mut self, custom: Vec<Persona>) -> Self {
        for persona in custom {
            if let Err(err) = check_prompt(&persona) {
                warn!(id = %persona.id, error = %err, "Skipping invalid custom coach");
                continue;
            }
            if self.find(&persona.id).is_some() {
                warn!(id = %persona.id, "Skipping custom coach with duplicate id");
                continue;
            }
            self.personas.push(persona);
        }
        self
    }

    pub fn find(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter()
    }

    pub fn free(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter().filter(|p| !p.is_premium)
    }

    pub fn premium(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter().filter(|p| p.is_premium)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

fn check_prompt(persona: &Persona) -> Result<(), PersonaError> {
    if persona.system_prompt.trim().is_empty() {
        return Err(PersonaError::EmptySystemPrompt(persona.id.clone()));
    }
    Ok(())
}

/// User input for a new coach. Blank optional fields get defaults.
#[derive(Debug, Clone, Default)]
pub struct CustomPersonaDraft {
    pub name: String,
    pub role: String,
    pub specialty: Option<String>,
    pub personality: Option<String>,
    pub avatar: Option<String>,
}

impl CustomPersonaDraft {
    pub fn into_persona(self, now_ms: i64) -> Result<Persona, PersonaError> {
        let name = self.name.trim();
        let role = self.role.trim();
        if name.is_empty() {
            return Err(PersonaError::MissingField("name"));
        }
        if role.is_empty() {
            return Err(PersonaError::MissingField("role"));
        }

        let non_blank = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let specialty = non_blank(self.specialty);
        let personality = non_blank(self.personality);

        let mut system_prompt = format!("You are {name}, a {role}.");
        if let Some(specialty) = &specialty {
            system_prompt.push_str(&format!(" You specialize in {specialty}."));
        }
        system_prompt.push_str(&format!(
            " Your personality is {}. Provide practical, actionable advice.",
            personality
                .clone()
                .unwrap_or_else(|| DEFAULT_PERSONALITY.to_lowercase())
        ));

        Ok(Persona {
            id: format!("custom-{now_ms}"),
            name: name.to_string(),
            role: role.to_string(),
            specialty: specialty.unwrap_or_else(|| DEFAULT_SPECIALTY.to_string()),
            personality: personality.unwrap_or_else(|| DEFAULT_PERSONALITY.to_string()),
            avatar: non_blank(self.avatar).unwrap_or_else(|| DEFAULT_AVATAR.to_string()),
            is_premium: false,
            system_prompt,
            sample_prompts: CUSTOM_SAMPLE_PROMPTS.iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// Custom coaches saved in the store. Unreadable data yields an empty list.
pub fn load_custom_personas(store: &dyn KeyValueStore) -> Vec<Persona> {
    let raw = match store.get(KEY_CUSTOM_COACHES) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(err) => {
            warn!(error = %err, "Failed to read custom coaches");
            return Vec::new();
        }
    };
    match toml::from_str::<CoachList>(&raw) {
        Ok(list) => list.coaches,
        Err(err) => {
            warn!(error = %err, "Ignoring unparseable custom coaches");
            Vec::new()
        }
    }
}

/// Append a custom coach to the saved list.
pub fn save_custom_persona(
    store: &dyn KeyValueStore,
    persona: Persona,
) -> Result<(), PersonaError> {
    let mut list = CoachList {
        coaches: load_custom_personas(store),
    };
    if list.coaches.iter().any(|p| p.id == persona.id) {
        return Err(PersonaError::DuplicateId(persona.id));
    }
    list.coaches.push(persona);
    let encoded = toml::to_string(&list).map_err(PersonaError::Serialize)?;
    store.set(KEY_CUSTOM_COACHES, &encoded)?;
    Ok(())
}
