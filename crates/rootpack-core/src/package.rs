use std::fmt;

use anyhow::{anyhow, Result};

pub const KNOWN_ARCHES: &[&str] = &["amd64", "i686"];

pub const DEFAULT_ARCH: &str = "amd64";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRef {
    pub name: String,
    pub arch: Option<String>,
    pub version: Option<String>,
}

impl PackageRef {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        validate_package_name(trimmed)?;

        for arch in KNOWN_ARCHES {
            let suffix = format!("-{arch}");
            if let Some(name) = trimmed.strip_suffix(suffix.as_str()) {
                if !name.is_empty() {
                    return Ok(Self {
                        name: name.to_string(),
                        arch: Some((*arch).to_string()),
                        version: None,
                    });
                }
            }

            let infix = format!("-{arch}-");
            if let Some(position) = trimmed.find(infix.as_str()) {
                let name = &trimmed[..position];
                let version = &trimmed[position + infix.len()..];
                if name.is_empty() {
                    continue;
                }
                if version.is_empty() {
                    return Err(anyhow!(
                        "package reference '{trimmed}' is missing a version after '-{arch}-'"
                    ));
                }
                return Ok(Self {
                    name: name.to_string(),
                    arch: Some((*arch).to_string()),
                    version: Some(version.to_string()),
                });
            }
        }

        Ok(Self {
            name: trimmed.to_string(),
            arch: None,
            version: None,
        })
    }

    pub fn has_arch_suffix(&self) -> bool {
        self.arch.is_some() && self.version.is_none()
    }

    pub fn is_fully_specified(&self) -> bool {
        self.arch.is_some() && self.version.is_some()
    }

    pub fn with_default_arch(mut self, arch: &str) -> Self {
        if self.arch.is_none() {
            self.arch = Some(arch.to_string());
        }
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(arch) = &self.arch {
            write!(f, "-{arch}")?;
        }
        if let Some(version) = &self.version {
            write!(f, "-{version}")?;
        }
        Ok(())
    }
}

/// Splits `<name>-<arch>-<version>` into its parts.
pub fn split_full_name(full_name: &str) -> Option<(&str, &str, &str)> {
    for arch in KNOWN_ARCHES {
        let infix = format!("-{arch}-");
        if let Some(position) = full_name.find(infix.as_str()) {
            let name = &full_name[..position];
            let version = &full_name[position + infix.len()..];
            if !name.is_empty() && !version.is_empty() {
                return Some((name, &full_name[position + 1..position + 1 + arch.len()], version));
            }
        }
    }
    None
}

pub(crate) fn validate_package_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("package name must not be empty"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(anyhow!(
            "invalid package name '{name}': must not start with '.' or '-'"
        ));
    }
    if let Some(invalid) = name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '+')))
    {
        return Err(anyhow!(
            "invalid package name '{name}': unsupported character {invalid:?}"
        ));
    }
    Ok(())
}
