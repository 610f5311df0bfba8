//! Modules: the lifecycle unit of the runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::contracts::Activator;
use crate::registry::LifecycleError;
use crate::version::Version;
use crate::wiring::{self, Capability, Requirement, Revision, WiringError};

pub const MODULE_SYMBOLIC_NAME: &str = "Module-SymbolicName";
pub const MODULE_VERSION: &str = "Module-Version";
pub const MODULE_ACTIVATOR: &str = "Module-Activator";
pub const MODULE_PRIORITY: &str = "Module-Priority";
pub const TYPE_HIERARCHY: &str = "Type-Hierarchy";

/// Id of the runtime's own pseudo-module.
pub const SYSTEM_MODULE_ID: u64 = 0;
pub const SYSTEM_SYMBOLIC_NAME: &str = "ripener.system";

/// What discovery hands to the runtime for one module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleDefinition {
    pub headers: BTreeMap<String, String>,
    pub root: PathBuf,
    /// Pre-enumerated resource paths relative to `root`, if discovery already
    /// listed them (archives, synthetic modules).
    pub resources: Option<Vec<String>>,
}

impl ModuleDefinition {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = Some(resources.into_iter().map(Into::into).collect());
        self
    }

    /// Last path component of the root, used for ordering and as the default
    /// symbolic name.
    pub fn resource_name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.to_string_lossy().into_owned())
    }

    /// The name matched against the runtime priority list.
    pub fn priority_name(&self) -> String {
        self.headers
            .get(MODULE_PRIORITY)
            .cloned()
            .unwrap_or_else(|| self.resource_name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Created,
    Starting,
    Active,
    Stopping,
    Stopped,
    Uninstalled,
}

impl ModuleState {
    /// States in which the module's context may be used.
    pub fn is_valid_context(self) -> bool {
        matches!(
            self,
            ModuleState::Starting | ModuleState::Active | ModuleState::Stopping
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A loaded module.
///
/// Identity and declarations are fixed at install time; only the lifecycle
/// state, the activator instance and the last failure change afterwards.
pub struct Module {
    id: u64,
    definition: ModuleDefinition,
    revision: Arc<Revision>,
    activator_ref: Option<String>,
    state: RwLock<ModuleState>,
    activator: Mutex<Option<Arc<dyn Activator>>>,
    failure: Mutex<Option<String>>,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("symbolic_name", &self.revision.symbolic_name)
            .field("version", &self.revision.version)
            .field("state", &self.state())
            .field("has_activator", &self.activator_ref.is_some())
            .finish()
    }
}

impl Module {
    /// Build a module from its definition, parsing the headers the core
    /// consumes.
    pub fn from_definition(id: u64, definition: ModuleDefinition) -> Result<Self, WiringError> {
        let headers = &definition.headers;
        let symbolic_name = headers
            .get(MODULE_SYMBOLIC_NAME)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| definition.resource_name());
        let version = match headers.get(MODULE_VERSION) {
            Some(raw) => raw.parse::<Version>().unwrap_or_else(|e| {
                tracing::warn!(module = id, error = %e, "Invalid module version, using 0.0.0");
                Version::default()
            }),
            None => Version::default(),
        };
        let capabilities = headers
            .get(wiring::PROVIDE_CAPABILITY)
            .map(|v| wiring::parse_capabilities(v))
            .transpose()?
            .unwrap_or_default();
        let requirements = headers
            .get(wiring::REQUIRE_CAPABILITY)
            .map(|v| wiring::parse_requirements(v))
            .transpose()?
            .unwrap_or_default();
        let activator_ref = headers
            .get(MODULE_ACTIVATOR)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            id,
            revision: Arc::new(Revision {
                module_id: id,
                symbolic_name,
                version,
                capabilities,
                requirements,
            }),
            activator_ref,
            definition,
            state: RwLock::new(ModuleState::Created),
            activator: Mutex::new(None),
            failure: Mutex::new(None),
        })
    }

    pub(crate) fn system() -> Self {
        let definition = ModuleDefinition::new(SYSTEM_SYMBOLIC_NAME)
            .header(MODULE_SYMBOLIC_NAME, SYSTEM_SYMBOLIC_NAME)
            .with_resources(Vec::<String>::new());
        Self {
            id: SYSTEM_MODULE_ID,
            revision: Arc::new(Revision {
                module_id: SYSTEM_MODULE_ID,
                symbolic_name: SYSTEM_SYMBOLIC_NAME.to_string(),
                version: Version::default(),
                capabilities: Vec::new(),
                requirements: Vec::new(),
            }),
            activator_ref: None,
            definition,
            state: RwLock::new(ModuleState::Created),
            activator: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_MODULE_ID
    }

    pub fn symbolic_name(&self) -> &str {
        &self.revision.symbolic_name
    }

    pub fn version(&self) -> &Version {
        &self.revision.version
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.definition.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.definition.headers.get(key).map(String::as_str)
    }

    pub fn root(&self) -> &Path {
        &self.definition.root
    }

    pub fn definition(&self) -> &ModuleDefinition {
        &self.definition
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.revision.capabilities
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.revision.requirements
    }

    pub fn revision(&self) -> Arc<Revision> {
        Arc::clone(&self.revision)
    }

    pub fn activator_ref(&self) -> Option<&str> {
        self.activator_ref.as_deref()
    }

    pub fn state(&self) -> ModuleState {
        *self.state.read()
    }

    /// Message of the last activator failure, kept for diagnostics.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Move to `to` if the current state is one of `from`.
    pub(crate) fn transition(
        &self,
        from: &[ModuleState],
        to: ModuleState,
    ) -> Result<ModuleState, LifecycleError> {
        let mut state = self.state.write();
        if !from.contains(&state) {
            return Err(LifecycleError::InvalidState {
                module: self.id,
                state: *state,
                target: to,
            });
        }
        let previous = *state;
        *state = to;
        Ok(previous)
    }

    pub(crate) fn force_state(&self, to: ModuleState) {
        *self.state.write() = to;
    }

    pub(crate) fn set_activator(&self, activator: Option<Arc<dyn Activator>>) {
        *self.activator.lock() = activator;
    }

    pub(crate) fn activator(&self) -> Option<Arc<dyn Activator>> {
        self.activator.lock().clone()
    }

    pub(crate) fn record_failure(&self, message: Option<String>) {
        *self.failure.lock() = message;
    }

    /// Resolve a resource path against the module's resource root.
    ///
    /// Paths are relative to the root; `..` components are rejected. When
    /// discovery pre-enumerated the resources only listed ones resolve.
    pub fn get_resource(&self, path: &str) -> Option<PathBuf> {
        let relative = normalize_resource_path(path)?;
        match &self.definition.resources {
            Some(listed) => listed
                .iter()
                .any(|r| normalize_resource_path(r).as_deref() == Some(relative.as_path()))
                .then(|| self.definition.root.join(&relative)),
            None => {
                let full = self.definition.root.join(&relative);
                full.exists().then_some(full)
            }
        }
    }

    /// Enumerate resource paths (relative, `/`-separated) under `prefix`.
    pub fn find_resources(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.trim_start_matches('/');
        let mut found: Vec<String> = match &self.definition.resources {
            Some(listed) => listed
                .iter()
                .map(|r| r.trim_start_matches('/').to_string())
                .filter(|r| r.starts_with(prefix))
                .collect(),
            None => {
                let mut acc = Vec::new();
                walk(&self.definition.root, &self.definition.root, &mut acc);
                acc.retain(|r| r.starts_with(prefix));
                acc
            }
        };
        found.sort();
        found
    }
}

fn normalize_resource_path(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in Path::new(path.trim_start_matches('/')).components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn walk(root: &Path, dir: &Path, acc: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_symlink() && path.is_dir() {
            // Linked directories may loop back into the root.
            continue;
        }
        if file_type.is_dir() {
            walk(root, &path, acc);
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            acc.push(rel.join("/"));
        }
    }
}

/// Lifecycle notifications delivered to module listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleEventKind {
    Installed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Uninstalled,
}

#[derive(Clone, Debug)]
pub struct ModuleEvent {
    pub kind: ModuleEventKind,
    pub module: Arc<Module>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn headers_are_parsed_at_install() {
        let def = ModuleDefinition::new("/mods/db-provider.jar")
            .header(MODULE_VERSION, "1.2")
            .header(wiring::PROVIDE_CAPABILITY, "db;v:Long=1")
            .header(wiring::REQUIRE_CAPABILITY, "log;resolution:=optional")
            .header(MODULE_ACTIVATOR, " demo.Activator ");
        let m = Module::from_definition(4, def).unwrap();
        assert_eq!(m.symbolic_name(), "db-provider.jar");
        assert_eq!(m.version(), &Version::new(1, 2, 0));
        assert_eq!(m.capabilities().len(), 1);
        assert!(m.requirements()[0].is_optional());
        assert_eq!(m.activator_ref(), Some("demo.Activator"));
        assert_eq!(m.state(), ModuleState::Created);
        assert_eq!(m.revision().module_id, 4);
    }

    #[test]
    fn malformed_capability_header_fails_install() {
        let def = ModuleDefinition::new("x").header(wiring::PROVIDE_CAPABILITY, ";v=1");
        assert!(Module::from_definition(1, def).is_err());
    }

    #[test]
    fn transitions_are_checked() {
        let m = Module::from_definition(1, ModuleDefinition::new("x")).unwrap();
        m.transition(&[ModuleState::Created], ModuleState::Starting)
            .unwrap();
        let err = m
            .transition(&[ModuleState::Created], ModuleState::Starting)
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState {
                state: ModuleState::Starting,
                ..
            }
        ));
    }

    #[test]
    fn resources_from_directory_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("conf/nested")).unwrap();
        fs::write(dir.path().join("conf/a.yaml"), "a").unwrap();
        fs::write(dir.path().join("conf/nested/b.yaml"), "b").unwrap();
        fs::write(dir.path().join("readme.txt"), "r").unwrap();

        let m = Module::from_definition(1, ModuleDefinition::new(dir.path())).unwrap();
        assert!(m.get_resource("/conf/a.yaml").is_some());
        assert!(m.get_resource("conf/missing.yaml").is_none());
        assert!(m.get_resource("../etc/passwd").is_none());
        assert_eq!(
            m.find_resources("conf"),
            vec!["conf/a.yaml".to_string(), "conf/nested/b.yaml".to_string()]
        );
    }

    #[cfg(unix)]
    #[test]
    fn linked_directories_are_not_walked() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("conf")).unwrap();
        fs::write(dir.path().join("conf/a.yaml"), "a").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("conf/loop")).unwrap();

        let m = Module::from_definition(1, ModuleDefinition::new(dir.path())).unwrap();
        assert_eq!(m.find_resources(""), vec!["conf/a.yaml".to_string()]);
    }

    #[test]
    fn resources_from_listing() {
        let def = ModuleDefinition::new("/virtual/m").with_resources(["a/x.txt", "/b/y.txt"]);
        let m = Module::from_definition(1, def).unwrap();
        assert_eq!(m.get_resource("b/y.txt"), Some(PathBuf::from("/virtual/m/b/y.txt")));
        assert!(m.get_resource("c.txt").is_none());
        assert_eq!(m.find_resources("a/"), vec!["a/x.txt".to_string()]);
    }
}
