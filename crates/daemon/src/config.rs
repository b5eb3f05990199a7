//! Module configuration.
//!
//! A line-oriented file of `[module]` sections with `key = value` entries:
//!
//! ```text
//! [backup]
//! path = /srv/backup
//! comment = nightly backups
//! is_readable = true
//! is_writable = false
//! auth_users = alice, bob
//! secrets_file = /etc/rrsyncd.secrets
//! ```
//!
//! `path` is mandatory and must be absolute. Unknown keys are rejected so
//! typos fail loudly at startup instead of silently granting access.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DaemonError;
use crate::restrict::module_name_is_valid;

/// One exported module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Module name (`\w+`).
    pub name: String,
    /// Absolute filesystem root.
    pub path: PathBuf,
    /// Text shown in module listings.
    pub comment: String,
    /// Senders (downloads) allowed. Default true.
    pub is_readable: bool,
    /// Receivers (uploads) allowed. Default false.
    pub is_writable: bool,
    /// Users allowed to authenticate; empty means no auth required.
    pub auth_users: Vec<String>,
    /// File of `user:password` lines backing authentication.
    pub secrets_file: Option<PathBuf>,
}

impl Module {
    fn new(name: String) -> Self {
        Self {
            name,
            path: PathBuf::new(),
            comment: String::new(),
            is_readable: true,
            is_writable: false,
            auth_users: Vec::new(),
            secrets_file: None,
        }
    }

    /// True when clients must authenticate before using the module.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        !self.auth_users.is_empty()
    }
}

/// The daemon's module table.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    modules: Vec<Module>,
}

impl DaemonConfig {
    /// Parses a configuration file.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Parses configuration text.
    pub fn parse(text: &str) -> Result<Self, DaemonError> {
        let mut modules: Vec<Module> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let number = index + 1;
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                if !module_name_is_valid(name) {
                    return Err(DaemonError::BadModuleName(name.to_string()));
                }
                if modules.iter().any(|module| module.name == name) {
                    return Err(DaemonError::Config {
                        line: number,
                        reason: format!("duplicate module {name:?}"),
                    });
                }
                modules.push(Module::new(name.to_string()));
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(DaemonError::Config {
                    line: number,
                    reason: format!("expected key = value, got {line:?}"),
                });
            };
            let key = key.trim();
            let value = value.trim();

            let Some(module) = modules.last_mut() else {
                return Err(DaemonError::Config {
                    line: number,
                    reason: "key outside a [module] section".to_string(),
                });
            };

            match key {
                "path" => {
                    let path = PathBuf::from(value);
                    if !path.is_absolute() {
                        return Err(DaemonError::Config {
                            line: number,
                            reason: format!("module path {value:?} is not absolute"),
                        });
                    }
                    module.path = path;
                }
                "comment" => module.comment = value.to_string(),
                "is_readable" => module.is_readable = parse_bool(value, number)?,
                "is_writable" => module.is_writable = parse_bool(value, number)?,
                "auth_users" => {
                    module.auth_users = value
                        .split([',', ' '])
                        .filter(|user| !user.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "secrets_file" => module.secrets_file = Some(PathBuf::from(value)),
                _ => {
                    return Err(DaemonError::Config {
                        line: number,
                        reason: format!("unknown key {key:?}"),
                    });
                }
            }
        }

        for module in &modules {
            if module.path.as_os_str().is_empty() {
                return Err(DaemonError::Config {
                    line: 0,
                    reason: format!("module {:?} has no path", module.name),
                });
            }
            if module.requires_auth() && module.secrets_file.is_none() {
                return Err(DaemonError::Config {
                    line: 0,
                    reason: format!("module {:?} has auth_users but no secrets_file", module.name),
                });
            }
        }

        Ok(Self { modules })
    }

    /// Looks a module up by name.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|module| module.name == name)
    }

    /// Modules in declaration order.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }
}

fn parse_bool(value: &str, line: usize) -> Result<bool, DaemonError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(DaemonError::Config {
            line,
            reason: format!("expected a boolean, got {value:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# daemon modules
[Uploads]
path = /srv/uploads
comment = drop zone
is_writable = yes

[archive]
path = /srv/archive
is_readable = true
";

    #[test]
    fn sample_config_parses() {
        let config = DaemonConfig::parse(SAMPLE).expect("valid config");
        let uploads = config.module("Uploads").expect("module present");
        assert_eq!(uploads.path, PathBuf::from("/srv/uploads"));
        assert_eq!(uploads.comment, "drop zone");
        assert!(uploads.is_writable);
        assert!(uploads.is_readable);
        assert!(!uploads.requires_auth());

        let archive = config.module("archive").expect("module present");
        assert!(!archive.is_writable);
    }

    #[test]
    fn missing_path_is_rejected() {
        assert!(DaemonConfig::parse("[m]\ncomment = no path\n").is_err());
    }

    #[test]
    fn relative_path_is_rejected() {
        assert!(DaemonConfig::parse("[m]\npath = relative/dir\n").is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DaemonConfig::parse("[m]\npath = /srv/m\nuse chroot = yes\n").is_err());
    }

    #[test]
    fn bad_module_names_are_rejected() {
        assert!(DaemonConfig::parse("[bad name]\npath = /srv/m\n").is_err());
        assert!(DaemonConfig::parse("[]\npath = /srv/m\n").is_err());
    }

    #[test]
    fn keys_outside_sections_are_rejected() {
        assert!(DaemonConfig::parse("path = /srv/m\n").is_err());
    }

    #[test]
    fn duplicate_modules_are_rejected() {
        assert!(DaemonConfig::parse("[m]\npath = /a\n[m]\npath = /b\n").is_err());
    }

    #[test]
    fn auth_users_require_a_secrets_file() {
        assert!(DaemonConfig::parse("[m]\npath = /srv/m\nauth_users = alice\n").is_err());
        let config = DaemonConfig::parse(
            "[m]\npath = /srv/m\nauth_users = alice, bob\nsecrets_file = /etc/secrets\n",
        )
        .expect("valid config");
        let module = config.module("m").expect("module present");
        assert_eq!(module.auth_users, ["alice", "bob"]);
        assert!(module.requires_auth());
    }
}
