use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::warn;
use walkdir::WalkDir;

use crate::contract::Plugin;
use crate::descriptor::EntryKind;
use crate::descriptor::MANIFEST_FILE;
use crate::descriptor::ManifestHeader;
use crate::descriptor::PluginDescriptor;
use crate::descriptor::read_manifest;
use crate::error::PluginError;
use crate::error::Result;
use crate::script::ScriptPlugin;

/// Content fingerprint of a plugin unit.
///
/// The default value stands for a unit that could not be read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub digest: String,
    pub size: u64,
}

impl Fingerprint {
    /// Hash the relative path and contents of every file in the unit, in
    /// sorted order. Hidden entries are skipped.
    pub fn compute(location: &Path) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let walker = WalkDir::new(location)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
        let mut buf = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                PluginError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(location)
                .unwrap_or_else(|_| entry.path());
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            buf.clear();
            std::fs::File::open(entry.path())?.read_to_end(&mut buf)?;
            hasher.update(&buf);
            size += buf.len() as u64;
        }
        let digest = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Ok(Self { digest, size })
    }

    /// Fingerprint as it is on disk right now; unreadable units map to the
    /// default value.
    pub fn current(location: &Path) -> Self {
        Self::compute(location).unwrap_or_else(|err| {
            debug!(path = %location.display(), error = %err, "unit unreadable");
            Self::default()
        })
    }

    pub fn is_missing(&self) -> bool {
        self.digest.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_missing() {
            return write!(f, "missing");
        }
        let short = self.digest.get(..12).unwrap_or(&self.digest);
        write!(f, "{short} ({} bytes)", self.size)
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Locate the manifest of a unit, returning `(stem, manifest_path)`.
fn unit_manifest(path: &Path) -> Option<(String, PathBuf)> {
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    if is_hidden(path.file_name()?) {
        return None;
    }
    if path.is_dir() {
        let manifest = path.join(MANIFEST_FILE);
        manifest.is_file().then_some((file_name, manifest))
    } else if path.extension().is_some_and(|ext| ext == "toml") {
        let stem = path.file_stem()?.to_string_lossy().into_owned();
        Some((stem, path.to_path_buf()))
    } else {
        None
    }
}

/// Scan `root` for plugin units, sorted by name.
///
/// A unit is either `<name>.toml` or a directory `<name>/` holding
/// `plugin.toml`. Discovery is lenient: a manifest whose header does not
/// parse still yields a descriptor named after its stem, keeping whatever
/// `kind` and `depends_on` can be read, so the failure surfaces on load in
/// the right group. Later units reusing an earlier name are skipped.
pub fn discover(root: &Path) -> Result<Vec<PluginDescriptor>> {
    if !root.is_dir() {
        warn!(root = %root.display(), "plugin root does not exist");
        return Ok(Vec::new());
    }
    let mut paths = std::fs::read_dir(root)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();

    let mut found = BTreeMap::new();
    for path in paths {
        let Some((stem, manifest_path)) = unit_manifest(&path) else {
            debug!(path = %path.display(), "not a plugin unit");
            continue;
        };
        let descriptor = match describe(&stem, &path, &manifest_path) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "manifest unreadable at discovery");
                let header = match read_manifest(&manifest_path) {
                    Ok(table) => ManifestHeader::salvage(&table),
                    Err(_) => ManifestHeader::default(),
                };
                match PluginDescriptor::from_header(
                    &stem,
                    path.clone(),
                    manifest_path,
                    header,
                    Fingerprint::current(&path),
                ) {
                    Ok(descriptor) => descriptor,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping unit");
                        continue;
                    }
                }
            }
        };
        if found.contains_key(&descriptor.name) {
            warn!(
                plugin = %descriptor.name,
                path = %path.display(),
                "duplicate plugin name, skipping unit"
            );
            continue;
        }
        found.insert(descriptor.name.clone(), descriptor);
    }
    Ok(found.into_values().collect())
}

fn describe(stem: &str, location: &Path, manifest_path: &Path) -> Result<PluginDescriptor> {
    let table = read_manifest(manifest_path)?;
    let header = ManifestHeader::from_table(&table, manifest_path)?;
    PluginDescriptor::from_header(
        stem,
        location.to_path_buf(),
        manifest_path.to_path_buf(),
        header,
        Fingerprint::compute(location)?,
    )
}

/// Re-read a unit from disk, keeping the slot's name and state.
///
/// Strict where [`discover`] is lenient: any manifest problem is an error.
pub fn refresh(descriptor: &PluginDescriptor) -> Result<PluginDescriptor> {
    let stem = descriptor.name.clone();
    let mut fresh = describe(&stem, &descriptor.location, &descriptor.manifest_path)?;
    if fresh.name != descriptor.name {
        warn!(
            plugin = %descriptor.name,
            renamed = %fresh.name,
            "plugin renamed on disk; keeping the loaded name until rescan"
        );
        fresh.name = descriptor.name.clone();
    }
    fresh.state = descriptor.state;
    Ok(fresh)
}

/// Whether the unit on disk differs from the fingerprint recorded at the
/// last load attempt.
pub fn changed(descriptor: &PluginDescriptor) -> bool {
    Fingerprint::current(&descriptor.location) != descriptor.fingerprint
}

/// Turns a descriptor into live plugin code.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>>;
}

/// Import a unit through `loader`, converting a panicking factory into a
/// load error.
pub fn import_unit(
    loader: &dyn ModuleLoader,
    descriptor: &PluginDescriptor,
) -> Result<Box<dyn Plugin>> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| loader.load(descriptor))) {
        Ok(result) => result,
        Err(panic) => Err(PluginError::load(
            &descriptor.name,
            format!("loader panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builds a native plugin from the manifest's `[config]` table.
pub type NativeFactory =
    Arc<dyn Fn(&toml::Table) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;

/// Compiled-in plugin factories keyed by entry name.
#[derive(Clone, Default)]
pub struct NativeCatalog {
    entries: BTreeMap<String, NativeFactory>,
}

impl fmt::Debug for NativeCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCatalog")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NativeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, entry: &str, factory: F)
    where
        F: Fn(&toml::Table) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.entries.insert(entry.to_string(), Arc::new(factory));
    }

    pub fn with<F>(mut self, entry: &str, factory: F) -> Self
    where
        F: Fn(&toml::Table) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.insert(entry, factory);
        self
    }

    pub fn get(&self, entry: &str) -> Option<NativeFactory> {
        self.entries.get(entry).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// Loader used by the host: native catalog entries plus declarative
/// script manifests.
#[derive(Debug, Clone, Default)]
pub struct DefaultModuleLoader {
    catalog: NativeCatalog,
}

impl DefaultModuleLoader {
    pub fn new(catalog: NativeCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &NativeCatalog {
        &self.catalog
    }
}

impl ModuleLoader for DefaultModuleLoader {
    fn load(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>> {
        let table = read_manifest(&descriptor.manifest_path)?;
        match &descriptor.entry {
            EntryKind::Native(entry) => {
                let factory = self.catalog.get(entry).ok_or_else(|| {
                    PluginError::load(
                        &descriptor.name,
                        format!("no native entry named '{entry}'"),
                    )
                })?;
                let config = match table.get("config") {
                    Some(toml::Value::Table(config)) => config.clone(),
                    Some(_) => {
                        return Err(PluginError::Manifest {
                            path: descriptor.manifest_path.display().to_string(),
                            message: "`config` must be a table".to_string(),
                        });
                    }
                    None => toml::Table::new(),
                };
                factory(&config).map_err(|err| PluginError::load(&descriptor.name, err))
            }
            EntryKind::Script => {
                let plugin =
                    ScriptPlugin::from_manifest(&descriptor.name, &table, &descriptor.manifest_path)?;
                Ok(Box::new(plugin))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PluginKind;
    use crate::lifecycle::PluginState;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    const BODY: &str = r#"
[register]
commands = [{ name = "hello", reply = "hi" }]

[unregister]
"#;

    fn script(header: &str) -> String {
        format!("{header}\n{BODY}")
    }

    #[test]
    fn test_discover_file_and_directory_units() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("zeta.toml"), script("[plugin]")).unwrap();
        fs::create_dir(root.path().join("alpha")).unwrap();
        fs::write(
            root.path().join("alpha").join(MANIFEST_FILE),
            "[plugin]\nkind = \"core\"\nentry = \"alpha\"\n",
        )
        .unwrap();
        fs::write(root.path().join("notes.txt"), "ignored").unwrap();
        fs::create_dir(root.path().join("empty_dir")).unwrap();
        fs::write(root.path().join(".hidden.toml"), BODY).unwrap();

        let found = discover(root.path()).unwrap();
        let names: Vec<&str> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(found[0].kind, PluginKind::Core);
        assert_eq!(found[0].entry, EntryKind::Native("alpha".into()));
        assert_eq!(found[1].entry, EntryKind::Script);
        assert!(!found[1].fingerprint.is_missing());
    }

    #[test]
    fn test_discover_missing_root_is_empty() {
        let root = TempDir::new().unwrap();
        let found = discover(&root.path().join("nope")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_discover_is_lenient_about_broken_manifests() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("broken.toml"), "[plugin\nname=").unwrap();

        let found = discover(root.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "broken");
        assert!(refresh(&found[0]).is_err());
    }

    #[test]
    fn test_fingerprint_tracks_content_and_size() {
        let root = TempDir::new().unwrap();
        let unit = root.path().join("unit");
        fs::create_dir(&unit).unwrap();
        fs::write(unit.join(MANIFEST_FILE), "a").unwrap();
        let first = Fingerprint::compute(&unit).unwrap();
        assert_eq!(first.size, 1);
        assert_eq!(first.digest.len(), 64);

        assert_eq!(Fingerprint::compute(&unit).unwrap(), first);

        fs::write(unit.join("extra.txt"), "bc").unwrap();
        let second = Fingerprint::compute(&unit).unwrap();
        assert_ne!(second, first);
        assert_eq!(second.size, 3);

        // Hidden files do not count.
        fs::write(unit.join(".swp"), "zzz").unwrap();
        assert_eq!(Fingerprint::compute(&unit).unwrap(), second);
    }

    #[test]
    fn test_changed_detects_edits_and_removal() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("p.toml");
        fs::write(&path, BODY).unwrap();
        let desc = discover(root.path()).unwrap().remove(0);
        assert!(!changed(&desc));

        fs::write(&path, format!("{BODY}\n# edited\n")).unwrap();
        assert!(changed(&desc));

        fs::remove_file(&path).unwrap();
        assert!(Fingerprint::current(&path).is_missing());
        assert!(changed(&desc));
    }

    #[test]
    fn test_refresh_keeps_name_and_state() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("p.toml");
        fs::write(&path, BODY).unwrap();
        let mut desc = discover(root.path()).unwrap().remove(0);
        desc.state = PluginState::Active;

        fs::write(
            &path,
            script("[plugin]\nname = \"other\"\nversion = \"2.0.0\""),
        )
        .unwrap();
        let fresh = refresh(&desc).unwrap();
        assert_eq!(fresh.name, "p");
        assert_eq!(fresh.version, "2.0.0");
        assert_eq!(fresh.state, PluginState::Active);
        assert_ne!(fresh.fingerprint, desc.fingerprint);
    }

    #[test]
    fn test_missing_native_entry_is_load_error() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("n.toml"), "[plugin]\nentry = \"ghost\"\n").unwrap();
        let desc = discover(root.path()).unwrap().remove(0);

        let loader = DefaultModuleLoader::default();
        let err = import_unit(&loader, &desc).err().unwrap();
        assert!(matches!(err, PluginError::LoadError { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_panicking_loader_is_load_error() {
        struct Boom;
        impl ModuleLoader for Boom {
            fn load(&self, _descriptor: &PluginDescriptor) -> Result<Box<dyn Plugin>> {
                panic!("kaboom");
            }
        }
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("n.toml"), BODY).unwrap();
        let desc = discover(root.path()).unwrap().remove(0);

        let err = import_unit(&Boom, &desc).err().unwrap();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn test_catalog_names_sorted() {
        let catalog = NativeCatalog::new()
            .with("b", |_| anyhow::bail!("unused"))
            .with("a", |_| anyhow::bail!("unused"));
        assert_eq!(catalog.names(), vec!["a", "b"]);
        assert!(catalog.get("a").is_some());
        assert!(catalog.get("c").is_none());
    }
}
