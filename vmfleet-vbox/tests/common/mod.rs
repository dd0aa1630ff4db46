//! In-memory stand-ins for VirtualBox and the guest side.
//!
//! `FakeVbox` answers the `VBoxManage` subcommands the provider issues and
//! keeps VM folders and disk files on a real temporary directory, so
//! teardown can be checked against the filesystem.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tempfile::TempDir;
use vmfleet_vbox::{
    ArtifactStore, CommandRunner, MediaPackager, RemoteShell, ShellConnector, VboxConfig, VboxContext, VboxError,
};

pub const VERSION: &str = "7.0.14";
pub const GUEST_IP: &str = "192.168.99.10";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub host_ip: String,
    pub host_port: u16,
    pub guest_port: u16,
}

#[derive(Debug, Default, Clone)]
pub struct FakeVm {
    pub running: bool,
    /// Reported `VMState` instead of running/poweroff, e.g. `paused`.
    pub raw_state: Option<String>,
    pub rules: Vec<Rule>,
    /// `"{controller}-{port}-{device}"` to medium path or `none`.
    pub slots: BTreeMap<String, String>,
    pub shared: Vec<(String, PathBuf)>,
    pub settings: BTreeMap<String, String>,
    pub extradata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FakeDhcp {
    pub network: String,
    pub ip: String,
    pub enabled: bool,
}

#[derive(Debug, Default)]
pub struct HvState {
    pub vms: BTreeMap<String, FakeVm>,
    pub dhcp: Vec<FakeDhcp>,
    pub calls: Vec<Vec<String>>,
    /// Guest IP queries still to answer with "No value set!", per VM.
    pub ip_pending: BTreeMap<String, usize>,
}

pub struct FakeVbox {
    machine_folder: PathBuf,
    state: Mutex<HvState>,
}

fn fail(args: &[&str], output: impl Into<String>) -> VboxError {
    VboxError::ExternalTool {
        command: format!("VBoxManage {}", args.join(" ")),
        output: output.into(),
    }
}

fn flag<'a>(args: &[&'a str], name: &str) -> Option<&'a str> {
    args.iter().position(|a| *a == name).and_then(|i| args.get(i + 1).copied())
}

impl FakeVbox {
    pub fn new(machine_folder: PathBuf) -> Self {
        Self {
            machine_folder,
            state: Mutex::new(HvState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, HvState> {
        self.state.lock().expect("fake hypervisor lock")
    }

    pub fn vm(&self, name: &str) -> Option<FakeVm> {
        self.state().vms.get(name).cloned()
    }

    pub fn power_off(&self, name: &str) {
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.running = false;
        }
    }

    /// Report `name` as being in hypervisor state `raw`.
    pub fn set_raw_state(&self, name: &str, raw: &str) {
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.raw_state = Some(raw.to_owned());
        }
    }

    /// Make the next `queries` IP lookups of `name` come back empty, as a
    /// guest that is still bringing its network up.
    pub fn withhold_ip(&self, name: &str, queries: usize) {
        self.state().ip_pending.insert(name.to_owned(), queries);
    }

    /// Number of invocations whose first argument is `subcommand`.
    pub fn count(&self, subcommand: &str) -> usize {
        self.state().calls.iter().filter(|c| c[0] == subcommand).count()
    }

    fn vm_mut<'s>(state: &'s mut HvState, args: &[&str], name: &str) -> Result<&'s mut FakeVm, VboxError> {
        state
            .vms
            .get_mut(name)
            .ok_or_else(|| fail(args, format!("Could not find a registered machine named '{name}'")))
    }

    fn render(name: &str, vm: &FakeVm) -> String {
        let mut out = format!("name=\"{name}\"\n");
        let state = vm
            .raw_state
            .as_deref()
            .unwrap_or(if vm.running { "running" } else { "poweroff" });
        out.push_str(&format!("VMState=\"{state}\"\n"));
        out.push_str("macaddress1=\"080027AABBCC\"\n");
        for (slot, medium) in &vm.slots {
            out.push_str(&format!("\"{slot}\"=\"{medium}\"\n"));
            if medium != "none" {
                if let Some(rest) = slot.strip_prefix("SATA-") {
                    out.push_str(&format!("\"SATA-ImageUUID-{rest}\"=\"00000000-0000-0000-0000-{rest:0>12}\"\n"));
                }
            }
        }
        for (i, rule) in vm.rules.iter().enumerate() {
            out.push_str(&format!(
                "Forwarding({i})=\"{},tcp,{},{},,{}\"\n",
                rule.name, rule.host_ip, rule.host_port, rule.guest_port
            ));
        }
        for (i, (share, path)) in vm.shared.iter().enumerate() {
            out.push_str(&format!("SharedFolderNameMachineMapping{}=\"{share}\"\n", i + 1));
            out.push_str(&format!("SharedFolderPathMachineMapping{}=\"{}\"\n", i + 1, path.display()));
        }
        out
    }

    fn modify(state: &mut HvState, args: &[&str]) -> Result<String, VboxError> {
        let vm = Self::vm_mut(state, args, args[1])?;
        let mut i = 2;
        while i < args.len() {
            let key = args[i];
            let value = args.get(i + 1).copied().unwrap_or_default();
            if key == "--natpf1" && value == "delete" {
                let name = args.get(i + 2).copied().unwrap_or_default();
                let before = vm.rules.len();
                vm.rules.retain(|r| r.name != name);
                if vm.rules.len() == before {
                    return Err(fail(args, format!("no NAT rule named {name}")));
                }
                i += 3;
                continue;
            }
            if key == "--natpf1" {
                let parts: Vec<&str> = value.split(',').collect();
                let rule = Rule {
                    name: parts[0].to_owned(),
                    host_ip: parts[2].to_owned(),
                    host_port: parts[3].parse().map_err(|_| fail(args, "bad host port"))?,
                    guest_port: parts[5].parse().map_err(|_| fail(args, "bad guest port"))?,
                };
                if vm.rules.iter().any(|r| r.name == rule.name || r.host_port == rule.host_port) {
                    return Err(fail(args, "NAT rule conflicts with an existing one"));
                }
                vm.rules.push(rule);
            } else {
                vm.settings.insert(key.to_owned(), value.to_owned());
            }
            i += 2;
        }
        Ok(String::new())
    }

    fn handle(&self, args: &[&str]) -> Result<String, VboxError> {
        let mut state = self.state();
        state.calls.push(args.iter().map(|a| (*a).to_owned()).collect());
        match args {
            ["--version"] => Ok(format!("{VERSION}r161095\n")),
            ["list", "systemproperties"] => Ok(format!(
                "API version:                     7_0\nDefault machine folder:          {}\n",
                self.machine_folder.display()
            )),
            ["list", "dhcpservers"] => Ok(state
                .dhcp
                .iter()
                .map(|d| {
                    format!(
                        "NetworkName:    {}\nDhcpd IP:       {}\nNetworkMask:    255.255.255.0\nEnabled:        {}\n\n",
                        d.network,
                        d.ip,
                        if d.enabled { "Yes" } else { "No" }
                    )
                })
                .collect()),
            ["dhcpserver", "add", ..] => {
                let network = flag(args, "--netname").unwrap_or_default().to_owned();
                if state.dhcp.iter().any(|d| d.network == network) {
                    return Err(fail(args, "DHCP server already exists"));
                }
                state.dhcp.push(FakeDhcp {
                    network,
                    ip: flag(args, "--ip").unwrap_or_default().to_owned(),
                    enabled: args.contains(&"--enable"),
                });
                Ok(String::new())
            }
            ["dhcpserver", "modify", ..] => {
                let network = flag(args, "--netname").unwrap_or_default();
                let server = state
                    .dhcp
                    .iter_mut()
                    .find(|d| d.network == network)
                    .ok_or_else(|| fail(args, "no such DHCP server"))?;
                server.enabled = !args.contains(&"--disable");
                Ok(String::new())
            }
            ["dhcpserver", "remove", ..] => {
                let network = flag(args, "--netname").unwrap_or_default();
                let before = state.dhcp.len();
                state.dhcp.retain(|d| d.network != network);
                if state.dhcp.len() == before {
                    return Err(fail(args, "no such DHCP server"));
                }
                Ok(String::new())
            }
            ["showvminfo", name, "--machinereadable"] => match state.vms.get(*name) {
                Some(vm) => Ok(Self::render(name, vm)),
                None => Err(fail(args, format!("Could not find a registered machine named '{name}'"))),
            },
            ["createvm", ..] => {
                let name = flag(args, "--name").unwrap_or_default().to_owned();
                if state.vms.contains_key(&name) {
                    return Err(fail(args, "machine already exists"));
                }
                let folder = self.machine_folder.join(&name);
                std::fs::create_dir_all(&folder).map_err(|e| fail(args, e.to_string()))?;
                std::fs::write(folder.join(format!("{name}.vbox")), b"<VirtualBox/>")
                    .map_err(|e| fail(args, e.to_string()))?;
                state.vms.insert(name, FakeVm::default());
                Ok(String::new())
            }
            ["storagectl", name, ..] => Self::vm_mut(&mut state, args, name).map(|_| String::new()),
            ["modifyvm", ..] => Self::modify(&mut state, args),
            ["startvm", name, ..] => {
                let vm = Self::vm_mut(&mut state, args, name)?;
                if vm.running {
                    return Err(fail(args, "machine is already running"));
                }
                vm.running = true;
                Ok(String::new())
            }
            ["controlvm", name, "poweroff"] => {
                let vm = Self::vm_mut(&mut state, args, name)?;
                if !vm.running {
                    return Err(fail(args, "machine is not running"));
                }
                vm.running = false;
                Ok(String::new())
            }
            ["unregistervm", name] => {
                let name = (*name).to_owned();
                if state.vms.remove(&name).is_none() {
                    return Err(fail(args, "not registered"));
                }
                let _ = std::fs::remove_file(self.machine_folder.join(&name).join(format!("{name}.vbox")));
                Ok(String::new())
            }
            ["storageattach", name, ..] => {
                let controller = flag(args, "--storagectl").unwrap_or_default();
                let port = flag(args, "--port").unwrap_or_default();
                let device = flag(args, "--device").unwrap_or_default();
                let medium = flag(args, "--medium").unwrap_or_default();
                if medium != "none" && !Path::new(medium).exists() {
                    return Err(fail(args, format!("medium {medium} does not exist")));
                }
                let vm = Self::vm_mut(&mut state, args, name)?;
                vm.slots.insert(format!("{controller}-{port}-{device}"), medium.to_owned());
                Ok(String::new())
            }
            ["sharedfolder", "add", name, ..] => {
                let share = flag(args, "--name").unwrap_or_default().to_owned();
                let host = PathBuf::from(flag(args, "--hostpath").unwrap_or_default());
                let vm = Self::vm_mut(&mut state, args, name)?;
                if vm.shared.iter().any(|(s, _)| *s == share) {
                    return Err(fail(args, "shared folder already exists"));
                }
                vm.shared.push((share, host));
                Ok(String::new())
            }
            ["setextradata", name, key, value] => {
                let vm = Self::vm_mut(&mut state, args, name)?;
                vm.extradata.insert((*key).to_owned(), (*value).to_owned());
                Ok(String::new())
            }
            ["clonemedium", "disk", source, target] => {
                if Path::new(target).exists() {
                    return Err(fail(args, "target medium already exists"));
                }
                let bytes = std::fs::read(source).map_err(|e| fail(args, e.to_string()))?;
                write_file(Path::new(target), &bytes).map_err(|e| fail(args, e))?;
                Ok(String::new())
            }
            ["createmedium", "disk", ..] => {
                let file = flag(args, "--filename").unwrap_or_default();
                write_file(Path::new(file), b"volume").map_err(|e| fail(args, e))?;
                Ok(String::new())
            }
            ["closemedium", "disk", file, "--delete"] => {
                let in_use = state.vms.values().any(|vm| vm.slots.values().any(|m| m == file));
                if in_use {
                    return Err(fail(args, "medium is attached to a machine"));
                }
                std::fs::remove_file(file).map_err(|e| fail(args, e.to_string()))?;
                Ok(String::new())
            }
            ["export", name, "-o", ovf] => {
                let vm = match state.vms.get(*name) {
                    Some(vm) if !vm.running => vm,
                    _ => return Err(fail(args, "machine must be powered off")),
                };
                let ovf = Path::new(ovf);
                write_file(ovf, b"<Envelope/>").map_err(|e| fail(args, e))?;
                // One disk file per attached SATA medium, system disk first.
                let disks = vm
                    .slots
                    .iter()
                    .filter(|(slot, medium)| slot.starts_with("SATA-") && *medium != "none");
                for (i, (slot, _)) in disks.enumerate() {
                    let disk = ovf.with_file_name(format!("{name}-disk{:03}.vmdk", i + 1));
                    let bytes: &[u8] = if slot == "SATA-0-0" { b"exported" } else { b"exported volume" };
                    write_file(&disk, bytes).map_err(|e| fail(args, e))?;
                }
                Ok(String::new())
            }
            ["guestproperty", "get", name, _] => {
                let running = match state.vms.get(*name) {
                    Some(vm) => vm.running,
                    None => return Err(fail(args, "not registered")),
                };
                let pending = state.ip_pending.get_mut(*name).filter(|n| **n > 0);
                match pending {
                    Some(n) if running => {
                        *n -= 1;
                        Ok("No value set!\n".to_owned())
                    }
                    _ if running => Ok(format!("Value: {GUEST_IP}\n")),
                    _ => Ok("No value set!\n".to_owned()),
                }
            }
            _ => Err(fail(args, "unsupported by the fake")),
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(path, bytes).map_err(|e| e.to_string())
}

#[async_trait]
impl CommandRunner for FakeVbox {
    async fn execute(&self, args: &[&str]) -> Result<String, VboxError> {
        self.handle(args)
    }
}

/// What happened inside one guest.
#[derive(Debug, Default, Clone)]
pub struct GuestState {
    pub tools_marker: Option<String>,
    pub tools_installs: usize,
    pub commands: Vec<String>,
}

/// Guests keyed by VM name; shells connect only to running VMs whose SSH
/// rule forwards the requested port.
pub struct FakeGuests {
    hypervisor: Arc<FakeVbox>,
    guests: Arc<Mutex<BTreeMap<String, GuestState>>>,
}

impl FakeGuests {
    pub fn new(hypervisor: Arc<FakeVbox>) -> Self {
        Self {
            hypervisor,
            guests: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn guest(&self, vm: &str) -> GuestState {
        self.guests.lock().expect("guest lock").get(vm).cloned().unwrap_or_default()
    }

    /// A shell into `vm` without going through port forwarding.
    pub fn shell_for(&self, vm: &str) -> FakeShell {
        FakeShell {
            vm: vm.to_owned(),
            hypervisor: Arc::clone(&self.hypervisor),
            guests: Arc::clone(&self.guests),
        }
    }
}

#[async_trait]
impl ShellConnector for FakeGuests {
    async fn connect(&self, host: &str, port: u16, _user: &str) -> Result<Arc<dyn RemoteShell>, VboxError> {
        let found = {
            let state = self.hypervisor.state();
            state
                .vms
                .iter()
                .find(|(_, vm)| vm.running && vm.rules.iter().any(|r| r.name == "ssh" && r.host_port == port))
                .map(|(name, _)| name.clone())
        };
        match found {
            Some(vm) => Ok(Arc::new(self.shell_for(&vm))),
            None => Err(VboxError::shell(format!("{host}:{port}"), "connection refused")),
        }
    }
}

pub struct FakeShell {
    vm: String,
    hypervisor: Arc<FakeVbox>,
    guests: Arc<Mutex<BTreeMap<String, GuestState>>>,
}

impl FakeShell {
    fn with_guest<T>(&self, f: impl FnOnce(&mut GuestState) -> T) -> T {
        let mut guests = self.guests.lock().expect("guest lock");
        f(guests.entry(self.vm.clone()).or_default())
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn run_script(&self, script: &str) -> Result<(), VboxError> {
        let version = script
            .lines()
            .find_map(|l| {
                let l = l.trim();
                l.strip_prefix("echo ")
                    .and_then(|rest| rest.split_once(" > "))
                    .map(|(v, _)| v.to_owned())
            })
            .unwrap_or_default();
        self.with_guest(|g| {
            if g.tools_marker.as_deref() != Some(version.as_str()) {
                g.tools_installs += 1;
                g.tools_marker = Some(version);
            }
        });
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<(), VboxError> {
        self.run_command_output(command).await.map(drop)
    }

    async fn run_command_output(&self, command: &str) -> Result<String, VboxError> {
        self.with_guest(|g| g.commands.push(command.to_owned()));
        if command.contains("shutdown -P now") {
            self.hypervisor.power_off(&self.vm);
            return Ok(String::new());
        }
        if command.contains("boot-finished") {
            return Ok("1\n".to_owned());
        }
        if command.starts_with("cat ") {
            return Ok(self.with_guest(|g| g.tools_marker.clone().unwrap_or_default()));
        }
        Ok(String::new())
    }
}

/// Serves every URL from a directory, creating the file on first request.
pub struct FakeArtifacts {
    root: PathBuf,
    pub resolved: Mutex<Vec<String>>,
}

#[async_trait]
impl ArtifactStore for FakeArtifacts {
    async fn resolve(&self, url: &str) -> Result<PathBuf, VboxError> {
        self.resolved.lock().expect("artifact lock").push(url.to_owned());
        let name = url.rsplit('/').next().unwrap_or(url);
        let path = self.root.join(name);
        if !path.exists() {
            std::fs::create_dir_all(&self.root)?;
            std::fs::write(&path, b"artifact")?;
        }
        Ok(path)
    }

    async fn unpack(&self, archive: &Path, _into: &Path) -> Result<(), VboxError> {
        Err(VboxError::Artifact {
            url: archive.display().to_string(),
            reason: "archives are not used in these tests".to_owned(),
        })
    }
}

/// Writes the seed files one after another into the target.
pub struct FakePackager;

#[async_trait]
impl MediaPackager for FakePackager {
    async fn package(&self, label: &str, files: &[(&str, &str)], target: &Path) -> Result<(), VboxError> {
        let mut image = format!("label={label}\n");
        for (name, contents) in files {
            image.push_str(&format!("--- {name}\n{contents}"));
        }
        tokio::fs::write(target, image).await?;
        Ok(())
    }
}

/// A provider context wired to fakes on a fresh temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub hypervisor: Arc<FakeVbox>,
    pub guests: Arc<FakeGuests>,
    pub artifacts: Arc<FakeArtifacts>,
    pub ctx: Arc<VboxContext>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let machines = dir.path().join("machines");
        let hypervisor = Arc::new(FakeVbox::new(machines));
        let guests = Arc::new(FakeGuests::new(Arc::clone(&hypervisor)));
        let artifacts = Arc::new(FakeArtifacts {
            root: dir.path().join("artifacts"),
            resolved: Mutex::new(Vec::new()),
        });
        let mut config = VboxConfig::new(dir.path().join("state"));
        config.shell_timeout_secs = 5;
        config.boot_timeout_secs = 5;
        config.ip_timeout_secs = 5;
        let ctx = Arc::new(VboxContext::new(
            config,
            Arc::clone(&hypervisor) as Arc<dyn CommandRunner>,
            Arc::clone(&guests) as Arc<dyn ShellConnector>,
            Arc::clone(&artifacts) as Arc<dyn ArtifactStore>,
            Arc::new(FakePackager),
        ));
        Self {
            dir,
            hypervisor,
            guests,
            artifacts,
            ctx,
        }
    }

    pub fn machine_folder(&self) -> PathBuf {
        self.dir.path().join("machines")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }
}
