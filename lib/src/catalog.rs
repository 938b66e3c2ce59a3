//! # Installation catalog
//!
//! The catalog is an ordered list of installation descriptors, read from
//! TOML.  Group separators are entries too: they keep their position so
//! consumers can render the grouping, but they are never selectable.

use std::collections::HashSet;
use std::fmt::Display;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// The catalog shipped with the binary.
const BUILTIN_CATALOG: &str = include_str!("../catalog/default.toml");

/// The category of provisioning procedure for an installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallKind {
    /// A kernel image unpacked in the control domain and registered as a qube.
    Image,
    /// Installer media booted in a freshly created qube.
    BootableMedia,
    /// A signed template package imported with `qvm-template`.
    PackageRepo,
}

impl InstallKind {
    /// Whether the user must name the qube being created.
    pub fn needs_target_name(&self) -> bool {
        match self {
            InstallKind::Image | InstallKind::BootableMedia => true,
            // The package carries its own template name
            InstallKind::PackageRepo => false,
        }
    }

    /// Whether a network provider is attached to the result.
    pub fn needs_network(&self) -> bool {
        match self {
            InstallKind::Image | InstallKind::BootableMedia => true,
            InstallKind::PackageRepo => false,
        }
    }

    /// Whether a label is applied to the result.
    pub fn needs_label(&self) -> bool {
        match self {
            InstallKind::Image => true,
            InstallKind::BootableMedia | InstallKind::PackageRepo => false,
        }
    }
}

impl Display for InstallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstallKind::Image => "image",
            InstallKind::BootableMedia => "bootable-media",
            InstallKind::PackageRepo => "package-repo",
        };
        f.write_str(s)
    }
}

/// Kind specific metadata of a selectable installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum Installation {
    /// See [`InstallKind::Image`].
    Image {
        /// URL of the compressed tarball.
        source: String,
        /// Path of the kernel inside the unpacked tarball.
        kernel: Utf8PathBuf,
    },
    /// See [`InstallKind::BootableMedia`].
    BootableMedia {
        /// Git repository with the unattended installer tooling.
        repository: String,
        /// Branch of `repository` to check out.
        branch: String,
        /// Packages installed in the guest after setup.
        packages: Vec<String>,
    },
    /// See [`InstallKind::PackageRepo`].
    PackageRepo {
        /// URL of the template package.
        source: String,
        /// URL of the signing key, fetched when `keyring` is missing.
        key_url: String,
        /// Keyring in the control domain used to verify the package.
        keyring: Utf8PathBuf,
    },
}

impl Installation {
    /// The kind of this installation.
    pub fn kind(&self) -> InstallKind {
        match self {
            Installation::Image { .. } => InstallKind::Image,
            Installation::BootableMedia { .. } => InstallKind::BootableMedia,
            Installation::PackageRepo { .. } => InstallKind::PackageRepo,
        }
    }
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Unique identifier; for separators this is the group label.
    pub id: String,
    /// The display group this entry belongs to.
    pub group_label: String,
    /// Icon resource name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// `None` for group separators.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<Installation>,
}

impl Descriptor {
    /// Separators start a display group and cannot be selected.
    pub fn is_separator(&self) -> bool {
        self.install.is_none()
    }

    /// The install kind, or `None` for a separator.
    pub fn kind(&self) -> Option<InstallKind> {
        self.install.as_ref().map(Installation::kind)
    }
}

/// The on-disk form of an entry; validated into a [`Descriptor`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawEntry {
    separator: Option<String>,
    id: Option<String>,
    kind: Option<InstallKind>,
    icon: Option<String>,
    source: Option<String>,
    kernel: Option<Utf8PathBuf>,
    repository: Option<String>,
    branch: Option<String>,
    packages: Option<Vec<String>>,
    key_url: Option<String>,
    keyring: Option<Utf8PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    entry: Vec<RawEntry>,
}

impl RawEntry {
    fn into_descriptor(self, group: &str) -> Result<Descriptor> {
        let require = |v: Option<String>, field: &str| {
            v.ok_or_else(|| anyhow!("missing `{field}`"))
        };
        if let Some(label) = self.separator {
            if self.id.is_some() || self.kind.is_some() {
                bail!("separator {label:?} cannot have an id or kind");
            }
            return Ok(Descriptor {
                id: label.clone(),
                group_label: label,
                icon: self.icon,
                install: None,
            });
        }
        let id = self.id.ok_or_else(|| anyhow!("entry needs `id` or `separator`"))?;
        let kind = self
            .kind
            .ok_or_else(|| anyhow!("installation {id} is missing `kind`"))?;
        let install = match kind {
            InstallKind::Image => Installation::Image {
                source: require(self.source, "source")?,
                kernel: self
                    .kernel
                    .ok_or_else(|| anyhow!("missing `kernel`"))?,
            },
            InstallKind::BootableMedia => Installation::BootableMedia {
                repository: require(self.repository, "repository")?,
                branch: require(self.branch, "branch")?,
                packages: self.packages.unwrap_or_default(),
            },
            InstallKind::PackageRepo => Installation::PackageRepo {
                source: require(self.source, "source")?,
                key_url: require(self.key_url, "key-url")?,
                keyring: self
                    .keyring
                    .ok_or_else(|| anyhow!("missing `keyring`"))?,
            },
        };
        Ok(Descriptor {
            id,
            group_label: group.to_owned(),
            icon: self.icon,
            install: Some(install),
        })
    }
}

/// The ordered, read-only registry of installations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<Descriptor>,
}

impl Catalog {
    /// Parse a catalog from TOML text.
    pub fn from_toml(buf: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(buf)?;
        let mut group = String::new();
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(file.entry.len());
        for (i, raw) in file.entry.into_iter().enumerate() {
            let d = raw
                .into_descriptor(&group)
                .with_context(|| format!("Parsing entry {i}"))?;
            if d.is_separator() {
                group.clone_from(&d.group_label);
            } else if !seen.insert(d.id.clone()) {
                bail!("Duplicate installation id {}", d.id);
            }
            entries.push(d);
        }
        Ok(Self { entries })
    }

    /// The catalog embedded in the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_CATALOG).context("Parsing builtin catalog")
    }

    /// Load a catalog from a TOML file.
    #[context("Loading catalog {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::from_toml(&buf)
    }

    /// All entries, separators included, in display order.
    pub fn list(&self) -> &[Descriptor] {
        &self.entries
    }

    /// Entries that can be selected for installation.
    pub fn selectable(&self) -> impl Iterator<Item = &Descriptor> {
        self.entries.iter().filter(|d| !d.is_separator())
    }

    /// Find an installation (or separator) by id.
    pub fn lookup(&self, id: &str) -> Option<&Descriptor> {
        // Separator labels and installation ids may coincide; prefer the installation
        self.selectable()
            .find(|d| d.id == id)
            .or_else(|| self.entries.iter().find(|d| d.id == id))
    }

    /// The install kind of `id`, if it names a selectable installation.
    pub fn install_kind_of(&self, id: &str) -> Option<InstallKind> {
        self.lookup(id).and_then(Descriptor::kind)
    }
}
