//! Cloud configuration rendered as a script run over SSH.
//!
//! Cloud providers hand user data to cloud-init at boot. Bootstrap runs the
//! same configuration itself once the address is verified, so the config is
//! rendered to plain bash instead. The script expects to run as root.

use crate::shell::sh_quote;

/// Packages the bootstrap node always needs.
pub const BASE_PACKAGES: &[&str] = &["curl", "tar"];

/// Configuration applied to the bootstrap node after it is reachable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudConfig {
    apt_update: bool,
    apt_upgrade: bool,
    packages: Vec<String>,
    run_cmds: Vec<String>,
}

impl CloudConfig {
    /// An empty configuration that changes nothing.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Whether to refresh the package index before installing packages.
    pub const fn set_apt_update(&mut self, enabled: bool) { self.apt_update = enabled; }

    /// Whether to upgrade installed packages.
    pub const fn set_apt_upgrade(&mut self, enabled: bool) { self.apt_upgrade = enabled; }

    /// Install `name` if it is not already requested.
    pub fn add_package(&mut self, name: &str) {
        if !self.packages.iter().any(|p| p == name) {
            self.packages.push(name.to_owned());
        }
    }

    /// Append a shell command to run after packages are installed.
    pub fn add_run_cmd(&mut self, cmd: impl Into<String>) { self.run_cmds.push(cmd.into()); }

    /// Render the configuration as a bash script.
    ///
    /// # Examples
    ///
    /// ```
    /// use clusterboot::cloudinit::CloudConfig;
    ///
    /// let mut cfg = CloudConfig::new();
    /// cfg.set_apt_update(true);
    /// assert!(cfg.configure_script().contains("apt_get update"));
    /// ```
    #[must_use]
    pub fn configure_script(&self) -> String {
        let mut script = String::from("set -e\n");
        let uses_apt = self.apt_update || self.apt_upgrade || !self.packages.is_empty();
        if uses_apt {
            script.push_str("export DEBIAN_FRONTEND=noninteractive\n");
            script.push_str("apt_get() { apt-get --option=Dpkg::Options::=--force-confold --assume-yes \"$@\"; }\n");
        }
        if self.apt_update {
            script.push_str("apt_get update\n");
        }
        if self.apt_upgrade {
            script.push_str("apt_get upgrade\n");
        }
        if !self.packages.is_empty() {
            let packages: Vec<String> = self.packages.iter().map(|p| sh_quote(p)).collect();
            script.push_str("apt_get install ");
            script.push_str(&packages.join(" "));
            script.push('\n');
        }
        for cmd in &self.run_cmds {
            script.push_str(cmd);
            if !cmd.ends_with('\n') {
                script.push('\n');
            }
        }
        script
    }
}
