//! # Configuration
//!
//! TOML drop-ins in `qvm-provision/` under the usual systemd bases
//! (e.g. `/etc/qvm-provision/10-local.toml`).  Files are merged in name
//! order; later values win.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::executor::{ExecutionPolicy, Shell};
use crate::provision::DEFAULT_PRIVATE_VOLUME_SIZE;

const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];
const CONFIG_DIR: &str = "qvm-provision";

/// The toplevel of a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConfigToplevel {
    provision: Option<Config>,
}

/// The `[provision]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Shell running the generated scripts.
    pub shell: Option<Utf8PathBuf>,
    /// Execution policy.
    pub policy: Option<ExecutionPolicy>,
    /// Catalog file replacing the builtin catalog.
    pub catalog: Option<Utf8PathBuf>,
    /// Disposable template workers are derived from when none is given.
    pub default_template: Option<String>,
    /// Target size of a new qube's private volume, in bytes.
    pub private_volume_size: Option<u64>,
}

impl Config {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
            if let Some(o) = o {
                *s = Some(o);
            }
        }
        mergeopt(&mut self.shell, other.shell);
        mergeopt(&mut self.policy, other.policy);
        mergeopt(&mut self.catalog, other.catalog);
        mergeopt(&mut self.default_template, other.default_template);
        mergeopt(&mut self.private_volume_size, other.private_volume_size);
    }

    /// The configured shell, or `/bin/sh`.
    pub fn shell(&self) -> Shell {
        self.shell
            .clone()
            .map(|program| Shell { program })
            .unwrap_or_default()
    }

    /// The configured policy, or the default.
    pub fn policy(&self) -> ExecutionPolicy {
        self.policy.unwrap_or_default()
    }

    /// The configured private volume size, or 60 GiB.
    pub fn private_volume_size(&self) -> u64 {
        self.private_volume_size
            .unwrap_or(DEFAULT_PRIVATE_VOLUME_SIZE)
    }
}

fn parse_fragment(buf: &str, path: &std::path::Path) -> Result<Option<Config>> {
    let mut unused = std::collections::HashSet::new();
    let de = toml::Deserializer::new(buf);
    let c: ConfigToplevel = serde_ignored::deserialize(de, |path| {
        unused.insert(path.to_string());
    })
    .with_context(|| format!("Parsing {path:?}"))?;
    for key in unused {
        tracing::warn!("{path:?}: Unknown key {key}");
    }
    Ok(c.provision)
}

/// Load and merge the configuration found under `bases`.
#[context("Loading configuration")]
pub fn load_config_from(bases: &[&str]) -> Result<Config> {
    let fragments = liboverdrop::scan(bases, CONFIG_DIR, &["toml"], true);
    let mut config = Config::default();
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path)?;
        if let Some(c) = parse_fragment(&buf, &path)? {
            tracing::debug!("Merging config from {path:?}: {c:?}");
            config.merge(c);
        }
    }
    Ok(config)
}

/// Load the configuration, merging all found configuration files.  No
/// configuration at all is not an error.
pub fn load_config() -> Result<Config> {
    load_config_from(SYSTEMD_CONVENTIONAL_BASES)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_parse_config() {
        let c = parse_fragment(
            indoc! { r#"
                [provision]
                policy = "single-script"
                default-template = "fedora-40-dvm"
            "# },
            "a.toml".as_ref(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(c.policy(), ExecutionPolicy::SingleScript);
        assert_eq!(c.default_template.as_deref(), Some("fedora-40-dvm"));
        assert_eq!(c.shell(), Shell::default());
        assert_eq!(c.private_volume_size(), DEFAULT_PRIVATE_VOLUME_SIZE);
        assert!(parse_fragment("[provision]\npolicy = \"sometimes\"\n", "b.toml".as_ref()).is_err());
        // Unknown keys are only warned about
        let c = parse_fragment("[provision]\ncolour = \"red\"\n", "c.toml".as_ref()).unwrap();
        assert_eq!(c, Some(Config::default()));
    }

    #[test]
    fn test_load_merged() -> Result<()> {
        let td = tempfile::tempdir()?;
        let usr = td.path().join("usr");
        let etc = td.path().join("etc");
        for d in [&usr, &etc] {
            std::fs::create_dir_all(d.join(CONFIG_DIR))?;
        }
        std::fs::write(
            usr.join(CONFIG_DIR).join("00-base.toml"),
            "[provision]\nshell = \"/bin/dash\"\nprivate-volume-size = 1024\n",
        )?;
        std::fs::write(
            etc.join(CONFIG_DIR).join("10-local.toml"),
            "[provision]\nprivate-volume-size = 2048\n",
        )?;
        let bases = [usr.to_str().unwrap(), etc.to_str().unwrap()];
        let c = load_config_from(&bases)?;
        assert_eq!(c.shell().program, "/bin/dash");
        assert_eq!(c.private_volume_size(), 2048);
        assert_eq!(c.policy(), ExecutionPolicy::Phased);

        let empty = td.path().join("empty");
        assert_eq!(load_config_from(&[empty.to_str().unwrap()])?, Config::default());
        Ok(())
    }
}
