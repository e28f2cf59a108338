//! QEMU command-line assembly.
//!
//! The argument vector is built in a fixed order: every backend (`-drive`,
//! `-object`, `-netdev`, `-fsdev`) comes before the `-device` that references
//! its `id`. The same inputs always produce a byte-identical plan.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::vm::budget::{BudgetLimits, ResourceBudget};
use crate::vm::ports::PortMap;
use crate::vm::{
    CDROM_IMAGE_NAME, DEFAULT_HOST_SHARE_ROOT, HDD_IMAGE_NAME, PROGRAM_NAME, QEMU_BINARY_NAME,
    QEMU_UPSTREAM_DNS_V4, QEMU_UPSTREAM_DNS_V6,
};

/// Inherited variables copied into the VM environment when present.
const PASSTHROUGH_ENV: &[&str] = &[
    "ANDROID_ROOT",
    "ANDROID_DATA",
    "ANDROID_ART_ROOT",
    "ANDROID_I18N_ROOT",
    "ANDROID_RUNTIME_ROOT",
    "ANDROID_TZDATA_ROOT",
];

/// Where the VM's binary, firmware, images and scratch space live.
#[derive(Debug, Clone)]
pub struct LaunchLayout {
    /// Firmware search root, disk image directory, `HOME` and working directory.
    pub install_root: PathBuf,
    /// Exported as `TMPDIR`.
    pub cache_dir: PathBuf,
    /// Executable actually run; the process still sees `vShell` as argv[0].
    pub qemu_binary: PathBuf,
    /// Directory exported to the guest over 9P as `host_storage`.
    pub host_share_root: PathBuf,
    pub dns_v4: String,
    pub dns_v6: String,
}

impl LaunchLayout {
    pub fn new(
        install_root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        qemu_binary: impl Into<PathBuf>,
    ) -> Self {
        Self {
            install_root: install_root.into(),
            cache_dir: cache_dir.into(),
            qemu_binary: qemu_binary.into(),
            host_share_root: PathBuf::from(DEFAULT_HOST_SHARE_ROOT),
            dns_v4: QEMU_UPSTREAM_DNS_V4.to_string(),
            dns_v6: QEMU_UPSTREAM_DNS_V6.to_string(),
        }
    }

    pub fn with_host_share_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.host_share_root = root.into();
        self
    }

    pub fn cdrom_image(&self) -> PathBuf {
        self.install_root.join(CDROM_IMAGE_NAME)
    }

    pub fn hdd_image(&self) -> PathBuf {
        self.install_root.join(HDD_IMAGE_NAME)
    }

    /// The share root exists and is a directory.
    pub fn host_share_available(&self) -> bool {
        self.host_share_root.is_dir()
    }
}

/// Everything needed to exec the VM process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub program: PathBuf,
    /// Full argument vector; `argv[0]` is the presented program name.
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl LaunchPlan {
    /// Arguments after argv[0].
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    /// Value following the first occurrence of `flag`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        let pos = self.argv.iter().position(|a| a == flag)?;
        self.argv.get(pos + 1).map(String::as_str)
    }
}

/// Assembles a [`LaunchPlan`] for a [`LaunchLayout`].
#[derive(Debug, Clone)]
pub struct ArgBuilder<'a> {
    layout: &'a LaunchLayout,
    limits: BudgetLimits,
}

impl<'a> ArgBuilder<'a> {
    pub fn new(layout: &'a LaunchLayout) -> Self {
        Self {
            layout,
            limits: BudgetLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: BudgetLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn build(
        &self,
        budget: &ResourceBudget,
        ports: &PortMap,
        host_share_available: bool,
        inherited_env: &BTreeMap<String, String>,
    ) -> Result<LaunchPlan> {
        ResourceBudget::new(budget.tcg_mib().into(), budget.ram_mib().into(), &self.limits)?;

        let cdrom = self.layout.cdrom_image();
        let hdd = self.layout.hdd_image();
        for image in [&cdrom, &hdd] {
            if !image.exists() {
                return Err(Error::MissingImage { path: image.clone() });
            }
        }

        let root = &self.layout.install_root;
        let mut argv: Vec<String> = vec![PROGRAM_NAME.to_string()];

        opt(&mut argv, "-L", display(root));
        opt(&mut argv, "-cpu", "max");
        opt(&mut argv, "-accel", format!("tcg,tb-size={}", budget.tcg_mib()));
        opt(&mut argv, "-m", budget.ram_mib().to_string());
        argv.push("-nodefaults".into());

        // Storage
        opt(
            &mut argv,
            "-drive",
            format!("file={},if=none,media=cdrom,index=0,id=cd0", display(&cdrom)),
        );
        opt(
            &mut argv,
            "-drive",
            format!(
                "file={},if=none,index=2,discard=unmap,detect-zeroes=unmap,cache=writeback,id=hd0",
                display(&hdd)
            ),
        );
        opt(&mut argv, "-device", "virtio-scsi-pci,id=virtio-scsi-pci0");
        opt(&mut argv, "-device", "scsi-cd,bus=virtio-scsi-pci0.0,id=scsi-cd0,drive=cd0");
        opt(&mut argv, "-device", "scsi-hd,bus=virtio-scsi-pci0.0,id=scsi-hd0,drive=hd0");
        opt(&mut argv, "-boot", "c,menu=on");

        // Entropy
        opt(&mut argv, "-object", "rng-random,filename=/dev/urandom,id=rng0");
        opt(&mut argv, "-device", "virtio-rng-pci,rng=rng0,id=virtio-rng-pci0");

        // Network
        opt(&mut argv, "-netdev", net_backend(ports));
        opt(&mut argv, "-device", "virtio-net-pci,netdev=vmnic0,id=virtio-net-pci0");

        if host_share_available {
            opt(
                &mut argv,
                "-fsdev",
                format!(
                    "local,security_model=mapped-file,id=fsdev0,multidevs=remap,path={}",
                    display(&self.layout.host_share_root)
                ),
            );
            opt(
                &mut argv,
                "-device",
                "virtio-9p-pci,fsdev=fsdev0,mount_tag=host_storage,id=virtio-9p-pci0",
            );
        }

        // Serial console on stdio
        argv.push("-nographic".into());
        opt(&mut argv, "-parallel", "none");
        opt(&mut argv, "-chardev", "stdio,id=serial0,mux=off,signal=off");
        opt(&mut argv, "-serial", "chardev:serial0");

        let plan = LaunchPlan {
            program: self.layout.qemu_binary.clone(),
            argv,
            env: self.environment(inherited_env),
            cwd: root.clone(),
        };
        debug!(program = %plan.program.display(), argv = ?plan.argv, "launch plan built");
        Ok(plan)
    }

    fn environment(&self, inherited: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let root = display(&self.layout.install_root);
        let mut env = BTreeMap::new();

        for name in PASSTHROUGH_ENV {
            if let Some(value) = inherited.get(*name) {
                env.insert((*name).to_string(), value.clone());
            }
        }
        env.insert("APP_RUNTIME_DIR".into(), root.clone());
        env.insert("LANG".into(), "en_US.UTF-8".into());
        env.insert("HOME".into(), root);
        env.insert("PATH".into(), "/system/bin".into());
        env.insert("TMPDIR".into(), display(&self.layout.cache_dir));
        env.insert("CONFIG_QEMU_DNS".into(), self.layout.dns_v4.clone());
        env.insert("CONFIG_QEMU_DNS6".into(), self.layout.dns_v6.clone());
        env
    }
}

/// First executable `qemu-system-x86_64` in `search_path`.
///
/// Entries that exist but are not executable are skipped.
pub fn locate_qemu(search_path: Option<&OsStr>, cwd: &Path) -> Result<PathBuf> {
    let found = which::which_in(QEMU_BINARY_NAME, search_path, cwd).map_err(|source| {
        Error::QemuNotFound {
            name: QEMU_BINARY_NAME,
            source,
        }
    })?;
    debug!(path = %found.display(), "found QEMU binary");
    Ok(found)
}

/// `user,id=vmnic0,hostfwd=...` with one forward per service.
pub fn net_backend(ports: &PortMap) -> String {
    let mut parts = vec!["user".to_string(), "id=vmnic0".to_string()];
    parts.extend(ports.hostfwd_clauses());
    parts.join(",")
}

fn opt(argv: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    argv.push(flag.to_string());
    argv.push(value.into());
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ports::Service;

    fn layout_with_images() -> (tempfile::TempDir, LaunchLayout) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CDROM_IMAGE_NAME), b"").unwrap();
        std::fs::write(dir.path().join(HDD_IMAGE_NAME), b"").unwrap();
        let layout = LaunchLayout::new(dir.path(), dir.path().join("cache"), "/usr/bin/qemu-system-x86_64");
        (dir, layout)
    }

    fn budget() -> ResourceBudget {
        ResourceBudget::new(362, 2048, &BudgetLimits::default()).unwrap()
    }

    #[test]
    fn default_forward_list() {
        assert_eq!(
            net_backend(&PortMap::default()),
            "user,id=vmnic0,hostfwd=tcp::8022-:22,hostfwd=tcp::5678-:5678,\
             hostfwd=tcp::5700-:5700,hostfwd=tcp::6379-:6379,hostfwd=tcp::9000-:9000"
        );
    }

    #[test]
    fn argv_has_exact_fragments_in_order() {
        let (dir, layout) = layout_with_images();
        let plan = ArgBuilder::new(&layout)
            .build(&budget(), &PortMap::default(), false, &BTreeMap::new())
            .unwrap();
        let root = dir.path().to_string_lossy().into_owned();

        let expected: Vec<String> = [
            "vShell",
            "-L",
            root.as_str(),
            "-cpu",
            "max",
            "-accel",
            "tcg,tb-size=362",
            "-m",
            "2048",
            "-nodefaults",
            "-drive",
            format!("file={root}/{CDROM_IMAGE_NAME},if=none,media=cdrom,index=0,id=cd0").as_str(),
            "-drive",
            format!(
                "file={root}/{HDD_IMAGE_NAME},if=none,index=2,discard=unmap,detect-zeroes=unmap,cache=writeback,id=hd0"
            )
            .as_str(),
            "-device",
            "virtio-scsi-pci,id=virtio-scsi-pci0",
            "-device",
            "scsi-cd,bus=virtio-scsi-pci0.0,id=scsi-cd0,drive=cd0",
            "-device",
            "scsi-hd,bus=virtio-scsi-pci0.0,id=scsi-hd0,drive=hd0",
            "-boot",
            "c,menu=on",
            "-object",
            "rng-random,filename=/dev/urandom,id=rng0",
            "-device",
            "virtio-rng-pci,rng=rng0,id=virtio-rng-pci0",
            "-netdev",
            net_backend(&PortMap::default()).as_str(),
            "-device",
            "virtio-net-pci,netdev=vmnic0,id=virtio-net-pci0",
            "-nographic",
            "-parallel",
            "none",
            "-chardev",
            "stdio,id=serial0,mux=off,signal=off",
            "-serial",
            "chardev:serial0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(plan.argv, expected);
        assert_eq!(plan.program, PathBuf::from("/usr/bin/qemu-system-x86_64"));
        assert_eq!(plan.cwd, dir.path());
    }

    #[test]
    fn host_share_inserted_before_serial() {
        let (_dir, layout) = layout_with_images();
        let layout = layout.with_host_share_root("/srv/share");
        let plan = ArgBuilder::new(&layout)
            .build(&budget(), &PortMap::default(), true, &BTreeMap::new())
            .unwrap();

        assert_eq!(
            plan.value_of("-fsdev"),
            Some("local,security_model=mapped-file,id=fsdev0,multidevs=remap,path=/srv/share")
        );
        let fsdev = plan.argv.iter().position(|a| a == "-fsdev").unwrap();
        let nographic = plan.argv.iter().position(|a| a == "-nographic").unwrap();
        let netdev = plan.argv.iter().position(|a| a == "-netdev").unwrap();
        assert!(netdev < fsdev && fsdev < nographic);
        assert_eq!(
            plan.argv[fsdev + 3],
            "virtio-9p-pci,fsdev=fsdev0,mount_tag=host_storage,id=virtio-9p-pci0"
        );
    }

    #[test]
    fn environment_contract() {
        let (dir, layout) = layout_with_images();
        let inherited: BTreeMap<String, String> = [
            ("ANDROID_ROOT", "/system"),
            ("ANDROID_TZDATA_ROOT", "/apex/com.android.tzdata"),
            ("PATH", "/usr/bin:/bin"),
            ("SECRET_TOKEN", "hunter2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let plan = ArgBuilder::new(&layout)
            .build(&budget(), &PortMap::default(), false, &inherited)
            .unwrap();
        let root = dir.path().to_string_lossy().into_owned();

        assert_eq!(plan.env.get("ANDROID_ROOT").map(String::as_str), Some("/system"));
        assert_eq!(
            plan.env.get("ANDROID_TZDATA_ROOT").map(String::as_str),
            Some("/apex/com.android.tzdata")
        );
        assert!(!plan.env.contains_key("ANDROID_DATA"));
        assert!(!plan.env.contains_key("ANDROID_ART_ROOT"));
        assert!(!plan.env.contains_key("SECRET_TOKEN"));
        assert_eq!(plan.env["PATH"], "/system/bin");
        assert_eq!(plan.env["HOME"], root);
        assert_eq!(plan.env["APP_RUNTIME_DIR"], root);
        assert_eq!(plan.env["LANG"], "en_US.UTF-8");
        assert_eq!(plan.env["TMPDIR"], dir.path().join("cache").to_string_lossy());
        assert_eq!(plan.env["CONFIG_QEMU_DNS"], "8.8.8.8");
        assert_eq!(plan.env["CONFIG_QEMU_DNS6"], "2001:4860:4860::8888");
    }

    #[test]
    fn missing_hdd_is_reported() {
        let (dir, layout) = layout_with_images();
        std::fs::remove_file(dir.path().join(HDD_IMAGE_NAME)).unwrap();
        let err = ArgBuilder::new(&layout)
            .build(&budget(), &PortMap::default(), false, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::MissingImage { ref path } if path.ends_with(HDD_IMAGE_NAME)));
    }

    #[test]
    fn budget_outside_builder_limits_is_rejected() {
        let (_dir, layout) = layout_with_images();
        let tight = BudgetLimits {
            max_ram_mib: 1024,
            ..BudgetLimits::default()
        };
        let err = ArgBuilder::new(&layout)
            .with_limits(tight)
            .build(&budget(), &PortMap::default(), false, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBudget { ram_mib: 2048, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn locate_skips_non_executable_candidates() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let shadow = dir.path().join("shadow");
        let real = dir.path().join("real");
        for (bin_dir, mode) in [(&shadow, 0o644), (&real, 0o755)] {
            std::fs::create_dir(bin_dir).unwrap();
            let bin = bin_dir.join(QEMU_BINARY_NAME);
            std::fs::write(&bin, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(mode)).unwrap();
        }
        let search = std::env::join_paths([&shadow, &real]).unwrap();

        let found = locate_qemu(Some(search.as_os_str()), dir.path()).unwrap();
        assert_eq!(found, real.join(QEMU_BINARY_NAME));

        let only_shadow = std::env::join_paths([&shadow]).unwrap();
        assert!(matches!(
            locate_qemu(Some(only_shadow.as_os_str()), dir.path()),
            Err(Error::QemuNotFound { name: QEMU_BINARY_NAME, .. })
        ));
    }

    #[test]
    fn custom_ports_reach_net_backend() {
        let (_dir, layout) = layout_with_images();
        let ports = PortMap::from_entries([
            (Service::Ssh, 10022),
            (Service::P5678, 15678),
            (Service::P5700, 15700),
            (Service::P6379, 16379),
            (Service::P9000, 19000),
        ])
        .unwrap();
        let plan = ArgBuilder::new(&layout)
            .build(&budget(), &ports, false, &BTreeMap::new())
            .unwrap();
        let netdev = plan.value_of("-netdev").unwrap();
        assert!(netdev.contains("hostfwd=tcp::10022-:22"));
        assert!(netdev.ends_with("hostfwd=tcp::19000-:9000"));
    }
}
