/*!
State-provider registry, snapshot capture and snapshot application.

UI surfaces opt in to persistence by registering a provider: a section of
the snapshot, a key inside it, and a pair of serialize/deserialize hooks.
Nothing that is not registered is ever captured or restored, and
password-typed providers are skipped in both directions.
*/

use crate::config::EngineConfig;
use crate::snapshot::{ElementScroll, InputState, ScrollPosition, SelectState, Snapshot, TextAreaState};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Which part of the snapshot a provider feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Location,
    UserId,
    /// Window-level scroll offsets (`{x, y}`)
    Scroll,
    /// Scroll offsets of one scrollable element (`{top, left}`)
    ScrollElement,
    Form,
    Input,
    Checkbox,
    Radio,
    Select,
    TextArea,
    Setting,
    AppState,
    ActiveTab,
    /// Boolean: whether the modal is open
    Modal,
    /// Boolean: whether the element is expanded
    Expanded,
}

/// Kind of field behind a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FieldKind {
    #[default]
    Plain,
    /// Never captured, never restored
    Password,
}

/// A participant in state capture and restore
pub trait StateProvider: Send + Sync {
    fn section(&self) -> Section;

    fn key(&self) -> &str;

    fn kind(&self) -> FieldKind {
        FieldKind::Plain
    }

    /// Current value, or `None` when there is nothing to capture
    fn serialize(&self) -> Option<Value>;

    /// Put a restored value back; returns false if it could not be applied
    fn deserialize(&self, value: &Value) -> bool;
}

type Getter = Box<dyn Fn() -> Option<Value> + Send + Sync>;
type Setter = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Provider built from a pair of closures
pub struct FieldProvider {
    section: Section,
    key: String,
    kind: FieldKind,
    get: Getter,
    set: Setter,
}

impl FieldProvider {
    pub fn new<G, S>(section: Section, key: impl Into<String>, get: G, set: S) -> Self
    where
        G: Fn() -> Option<Value> + Send + Sync + 'static,
        S: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            section,
            key: key.into(),
            kind: FieldKind::Plain,
            get: Box::new(get),
            set: Box::new(set),
        }
    }

    /// Mark this provider as a password field
    pub fn password(mut self) -> Self {
        self.kind = FieldKind::Password;
        self
    }
}

impl StateProvider for FieldProvider {
    fn section(&self) -> Section {
        self.section
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> FieldKind {
        self.kind
    }

    fn serialize(&self) -> Option<Value> {
        (self.get)()
    }

    fn deserialize(&self, value: &Value) -> bool {
        (self.set)(value)
    }
}

type ProviderMap = BTreeMap<(Section, String), Arc<dyn StateProvider>>;

/// Registry of opted-in providers, shared between capture and restore
#[derive(Default)]
pub struct StateRegistry {
    providers: RwLock<ProviderMap>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any provider with the same section and key
    pub fn register<P: StateProvider + 'static>(&self, provider: P) {
        let provider: Arc<dyn StateProvider> = Arc::new(provider);
        let id = (provider.section(), provider.key().to_string());
        if let Ok(mut providers) = self.providers.write() {
            providers.insert(id, provider);
        }
    }

    /// Convenience wrapper around [`FieldProvider::new`]
    pub fn register_fn<G, S>(&self, section: Section, key: impl Into<String>, get: G, set: S)
    where
        G: Fn() -> Option<Value> + Send + Sync + 'static,
        S: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.register(FieldProvider::new(section, key, get, set));
    }

    /// Remove a provider; returns whether one was registered
    pub fn unregister(&self, section: Section, key: &str) -> bool {
        self.providers
            .write()
            .map(|mut providers| providers.remove(&(section, key.to_string())).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.providers.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, section: Section, key: &str) -> Option<Arc<dyn StateProvider>> {
        self.providers
            .read()
            .ok()
            .and_then(|p| p.get(&(section, key.to_string())).cloned())
    }

    fn all(&self) -> Vec<Arc<dyn StateProvider>> {
        self.providers
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    fn in_section(&self, section: Section) -> Vec<Arc<dyn StateProvider>> {
        self.all()
            .into_iter()
            .filter(|p| p.section() == section)
            .collect()
    }
}

fn parse<T: DeserializeOwned>(provider: &dyn StateProvider, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!(
                section = ?provider.section(),
                key = provider.key(),
                error = %e,
                "Skipping provider with unexpected value shape"
            );
            None
        }
    }
}

/// Capture the current state of every registered provider
///
/// Best effort: providers with nothing to report or with a value of the
/// wrong shape are left out, and the external `app_state` blob stays
/// `None` when no provider supplies it.
pub fn capture(registry: &StateRegistry, config: &EngineConfig) -> Snapshot {
    let mut snapshot = Snapshot::new(config.state_version.clone());

    for provider in registry.all() {
        if provider.kind() == FieldKind::Password {
            continue;
        }
        let Some(value) = provider.serialize() else {
            continue;
        };
        let key = provider.key().to_string();
        let p = provider.as_ref();

        match provider.section() {
            Section::Location => snapshot.location = parse(p, value),
            Section::UserId => snapshot.user_id = parse(p, value),
            Section::ActiveTab => snapshot.active_tab = parse(p, value),
            Section::AppState => snapshot.app_state = Some(value),
            Section::Scroll => {
                if let Some(global) = parse::<ScrollPosition>(p, value) {
                    let scroll = snapshot.scroll_position.get_or_insert_with(Default::default);
                    scroll.x = global.x;
                    scroll.y = global.y;
                }
            }
            Section::ScrollElement => {
                if let Some(element) = parse::<ElementScroll>(p, value) {
                    snapshot
                        .scroll_position
                        .get_or_insert_with(Default::default)
                        .elements
                        .insert(key, element);
                }
            }
            Section::Form => {
                if let Some(fields) = parse::<Map<String, Value>>(p, value) {
                    snapshot.forms.insert(key, fields);
                }
            }
            Section::Input => {
                if let Some(input) = parse::<InputState>(p, value) {
                    if !input.input_type.eq_ignore_ascii_case("password") {
                        snapshot.inputs.insert(key, input);
                    }
                }
            }
            Section::Checkbox => {
                if let Some(checked) = parse(p, value) {
                    snapshot.checkboxes.insert(key, checked);
                }
            }
            Section::Radio => {
                if let Some(selected) = parse(p, value) {
                    snapshot.radios.insert(key, selected);
                }
            }
            Section::Select => {
                if let Some(select) = parse::<SelectState>(p, value) {
                    snapshot.selects.insert(key, select);
                }
            }
            Section::TextArea => {
                if let Some(textarea) = parse::<TextAreaState>(p, value) {
                    snapshot.textareas.insert(key, textarea);
                }
            }
            Section::Setting => {
                if config.allowed_settings.iter().any(|s| *s == key) {
                    snapshot.settings.insert(key, value);
                }
            }
            Section::Modal => {
                if parse::<bool>(p, value).unwrap_or(false) {
                    snapshot.open_modals.insert(key);
                }
            }
            Section::Expanded => {
                if parse::<bool>(p, value).unwrap_or(false) {
                    snapshot.expanded_elements.insert(key);
                }
            }
        }
    }

    snapshot
}

/// Singleton sections are registered under any key; the first one wins
fn singleton(registry: &StateRegistry, section: Section) -> Option<Arc<dyn StateProvider>> {
    registry.in_section(section).into_iter().next()
}

fn apply_one(provider: Option<Arc<dyn StateProvider>>, value: Value) -> bool {
    match provider {
        Some(p) if p.kind() != FieldKind::Password => p.deserialize(&value),
        _ => false,
    }
}

fn apply_map<T: serde::Serialize>(
    registry: &StateRegistry,
    section: Section,
    entries: &BTreeMap<String, T>,
) -> usize {
    entries
        .iter()
        .filter_map(|(key, entry)| serde_json::to_value(entry).ok().map(|v| (key, v)))
        .filter(|(key, value)| apply_one(registry.get(section, key), value.clone()))
        .count()
}

/// Push a snapshot back onto the registered providers
///
/// Entries without a matching provider are skipped. Returns the number of
/// values that were applied.
pub fn apply(registry: &StateRegistry, snapshot: &Snapshot) -> usize {
    let mut applied = 0;

    let scalars = [
        (Section::Location, snapshot.location.clone().map(Value::String)),
        (Section::UserId, snapshot.user_id.clone().map(Value::String)),
        (Section::ActiveTab, snapshot.active_tab.clone().map(Value::String)),
        (Section::AppState, snapshot.app_state.clone()),
    ];
    for (section, value) in scalars {
        if let Some(value) = value {
            if apply_one(singleton(registry, section), value) {
                applied += 1;
            }
        }
    }

    if let Some(scroll) = &snapshot.scroll_position {
        let global = serde_json::json!({ "x": scroll.x, "y": scroll.y });
        if apply_one(singleton(registry, Section::Scroll), global) {
            applied += 1;
        }
        applied += apply_map(registry, Section::ScrollElement, &scroll.elements);
    }

    applied += apply_map(registry, Section::Form, &snapshot.forms);
    applied += apply_map(registry, Section::Input, &snapshot.inputs);
    applied += apply_map(registry, Section::Checkbox, &snapshot.checkboxes);
    applied += apply_map(registry, Section::Radio, &snapshot.radios);
    applied += apply_map(registry, Section::Select, &snapshot.selects);
    applied += apply_map(registry, Section::TextArea, &snapshot.textareas);
    applied += apply_map(registry, Section::Setting, &snapshot.settings);

    for (section, ids) in [
        (Section::Modal, &snapshot.open_modals),
        (Section::Expanded, &snapshot.expanded_elements),
    ] {
        applied += ids
            .iter()
            .filter(|id| apply_one(registry.get(section, id), Value::Bool(true)))
            .count();
    }

    applied
}
