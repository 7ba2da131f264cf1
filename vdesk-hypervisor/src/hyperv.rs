//! Hyper-V adapter.
//!
//! Runs PowerShell against the host over WinRM. Scripts that return data end
//! with `ConvertTo-Json -Compress`; scripts that detect a missing VM or an
//! illegal transition throw a `VDESK_*` marker so the failure can be
//! classified. The VM uuid is the Hyper-V VM id (a GUID). Descriptor options:
//!
//! - `vhd_path`: directory for root VHDX files
//! - `switch`: virtual switch for the primary NIC (default `Default Switch`)

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::connection::{first_line, ps_quote, HostHandle, RemoteOutput, RemoteRequest};
use crate::error::{ControlError, Result};
use crate::traits::{reachability_outcome, AdapterCapabilities, HypervisorAdapter};
use crate::types::{DiskAttachSpec, PowerState, VirtualizationType, VmConfig, VmInfo};

const DEFAULT_VHD_PATH: &str = r"C:\ProgramData\Microsoft\Windows\Virtual Hard Disks";
const NOT_FOUND_MARKER: &str = "VDESK_NOT_FOUND";
const INVALID_STATE_MARKER: &str = "VDESK_INVALID_STATE";

/// Emits the VM in `$vm` as one line of JSON.
const EMIT_VM_INFO: &str = r#"$vm = Get-VM -Id $vm.Id
$nic = $vm.NetworkAdapters | Select-Object -First 1
$ip = $nic.IPAddresses | Where-Object { $_ -match '^\d+\.\d+\.\d+\.\d+$' } | Select-Object -First 1
[pscustomobject]@{ uuid = $vm.Id.ToString(); name = $vm.Name; state = $vm.State.ToString(); mac = $nic.MacAddress; address = $ip } | ConvertTo-Json -Compress"#;

#[derive(Debug, Deserialize)]
struct HvVmInfo {
    uuid: String,
    name: String,
    state: String,
    mac: Option<String>,
    address: Option<String>,
}

/// Hyper-V adapter bound to one host.
pub struct HyperVAdapter {
    host: HostHandle,
    vhd_path: String,
    switch: String,
}

impl HyperVAdapter {
    pub fn new(host: HostHandle) -> Self {
        let desc = host.descriptor();
        let vhd_path = desc.option_or("vhd_path", DEFAULT_VHD_PATH).to_string();
        let switch = desc.option_or("switch", "Default Switch").to_string();
        Self { host, vhd_path, switch }
    }

    async fn run(&self, entity: &str, script: String) -> Result<String> {
        let output = self.host.run(RemoteRequest::powershell(script)).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify(entity, &output))
        }
    }

    async fn run_json<T: serde::de::DeserializeOwned>(&self, entity: &str, script: String) -> Result<T> {
        let stdout = self.run(entity, script).await?;
        let line = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
        serde_json::from_str(line)
            .map_err(|e| ControlError::internal(entity, format!("unexpected PowerShell output: {}", e)))
    }

    fn create_script(&self, config: &VmConfig) -> String {
        let mut script = format!(
            "$name = {name}\n\
             $vm = Get-VM -Name $name -ErrorAction SilentlyContinue | Select-Object -First 1\n\
             if (-not $vm) {{\n\
             $vhd = Join-Path {dir} ($name + '-root.vhdx')\n",
            name = ps_quote(&config.name),
            dir = ps_quote(&self.vhd_path),
        );

        match &config.image {
            Some(parent) => script.push_str(&format!(
                "if (-not (Test-Path $vhd)) {{ New-VHD -Path $vhd -ParentPath {} -Differencing | Out-Null }}\n",
                ps_quote(parent)
            )),
            None => script.push_str(&format!(
                "if (-not (Test-Path $vhd)) {{ New-VHD -Path $vhd -SizeBytes {}GB -Dynamic | Out-Null }}\n",
                config.storage_gb
            )),
        }

        script.push_str(&format!(
            "$vm = New-VM -Name $name -Generation 2 -MemoryStartupBytes {}GB -VHDPath $vhd -SwitchName {}\n\
             Set-VMProcessor -VM $vm -Count {}\n",
            config.memory_gb,
            ps_quote(&self.switch),
            config.cpu_cores
        ));

        if config.gpus() > 0 {
            script.push_str(&format!(
                "1..{} | ForEach-Object {{ Add-VMGpuPartitionAdapter -VM $vm }}\n",
                config.gpus()
            ));
        }
        if let Some(mac) = config.network.as_ref().and_then(|n| n.mac.as_ref()) {
            script.push_str(&format!(
                "Set-VMNetworkAdapter -VM $vm -StaticMacAddress {}\n",
                ps_quote(&mac.replace(':', "").to_uppercase())
            ));
        }
        if let Some(payload) = &config.bootstrap {
            script.push_str(&format!("Set-VM -VM $vm -Notes {}\n", ps_quote(payload)));
        }

        script.push_str("}\nif ($vm.State -ne 'Running') { Start-VM -VM $vm }\n");
        script.push_str(EMIT_VM_INFO);
        script
    }
}

/// Script prefix that binds `$vm` or throws the not-found marker.
fn lookup(uuid: &str) -> String {
    format!(
        "$vm = Get-VM -Id {} -ErrorAction SilentlyContinue\nif (-not $vm) {{ throw '{}' }}\n",
        ps_quote(uuid),
        NOT_FOUND_MARKER
    )
}

/// Map a failed PowerShell invocation to the error taxonomy.
fn classify(entity: &str, output: &RemoteOutput) -> ControlError {
    let lower = output.stderr.to_lowercase();
    let message = output
        .stderr
        .lines()
        .map(str::trim)
        .find(|l| l.contains(INVALID_STATE_MARKER))
        .map(|l| l.to_string())
        .unwrap_or_else(|| first_line(&output.stderr).to_string());

    if output.stderr.contains(NOT_FOUND_MARKER)
        || lower.contains("unable to find a virtual machine")
        || lower.contains("cannot bind parameter 'id'")
    {
        ControlError::not_found(entity)
    } else if output.stderr.contains(INVALID_STATE_MARKER) || lower.contains("cannot change state") {
        ControlError::invalid_state(entity, message)
    } else if lower.contains("not enough memory")
        || lower.contains("insufficient")
        || lower.contains("not enough space")
        || lower.contains("insufficient system resources")
    {
        ControlError::capacity(entity, message)
    } else if lower.contains("already exists") {
        ControlError::conflict(entity, message)
    } else if lower.contains("access is denied") {
        ControlError::unavailable(entity, message)
    } else {
        ControlError::internal(entity, format!("PowerShell exited with {}: {}", output.status, message))
    }
}

fn parse_power_state(state: &str) -> PowerState {
    match state.trim() {
        "Running" => PowerState::Running,
        "Off" | "Saved" => PowerState::Stopped,
        "Paused" => PowerState::Paused,
        "Starting" | "Resuming" => PowerState::Starting,
        "Stopping" | "Saving" | "Pausing" => PowerState::Stopping,
        _ => PowerState::Unknown,
    }
}

/// Hyper-V reports MACs as `00155D010203`.
fn normalize_mac(mac: &str) -> String {
    if mac.contains(':') || mac.len() != 12 {
        return mac.to_lowercase();
    }
    mac.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_lowercase())
        .collect::<Vec<_>>()
        .join(":")
}

fn to_vm_info(info: HvVmInfo) -> VmInfo {
    VmInfo {
        uuid: info.uuid,
        name: info.name,
        power_state: parse_power_state(&info.state),
        address: info.address.filter(|a| !a.is_empty()),
        mac: info.mac.filter(|m| !m.is_empty()).map(|m| normalize_mac(&m)),
    }
}

/// Parse a device hint of the form `scsi:<controller>:<location>`.
fn parse_scsi_slot(device: &str) -> Option<(u32, u32)> {
    let mut parts = device.split(':');
    if parts.next()? != "scsi" {
        return None;
    }
    let controller = parts.next()?.parse().ok()?;
    let location = parts.next()?.parse().ok()?;
    Some((controller, location))
}

#[async_trait]
impl HypervisorAdapter for HyperVAdapter {
    fn kind(&self) -> VirtualizationType {
        VirtualizationType::HyperV
    }

    fn host_id(&self) -> &str {
        self.host.host_id()
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            name: "Hyper-V".to_string(),
            max_vcpus: 240,
            max_memory_gb: 12288,
            max_gpus: 4,
            supports_hotplug: true,
            supports_bootstrap: true,
            disk_formats: vec!["vhdx".to_string(), "vhd".to_string()],
        }
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn test_connection(&self) -> Result<bool> {
        let result = self
            .host
            .run(RemoteRequest::powershell("Get-VMHost | Select-Object -ExpandProperty Name"))
            .await;
        reachability_outcome(self.host.host_id(), result, |o| o.success())
    }

    #[instrument(skip(self, config), fields(host_id = %self.host.host_id(), vm_name = %config.name))]
    async fn create_vm(&self, config: &VmConfig) -> Result<VmInfo> {
        self.capabilities().check(config)?;
        let info: HvVmInfo = self.run_json(&config.name, self.create_script(config)).await?;
        info!(uuid = %info.uuid, "VM created and started");

        let mut vm = to_vm_info(info);
        if vm.address.is_none() {
            vm.address = config.network.as_ref().and_then(|n| n.address.clone());
        }
        Ok(vm)
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn start_vm(&self, uuid: &str) -> Result<()> {
        let script = format!(
            "{}switch ($vm.State.ToString()) {{\n\
             'Running' {{ 'noop' }}\n\
             'Paused' {{ Resume-VM -VM $vm }}\n\
             default {{ Start-VM -VM $vm }}\n\
             }}\n",
            lookup(uuid)
        );
        let out = self.run(uuid, script).await?;
        if out.trim() == "noop" {
            debug!("VM already running");
        } else {
            info!("VM started");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn stop_vm(&self, uuid: &str, force: bool) -> Result<()> {
        let stop = |flags: &str| {
            format!(
                "{}if ($vm.State.ToString() -eq 'Off') {{ 'noop' }} else {{ Stop-VM -VM $vm -Force{} }}\n",
                lookup(uuid),
                flags
            )
        };

        if !force {
            match self.run(uuid, stop("")).await {
                Ok(_) => {
                    info!("VM shut down");
                    return Ok(());
                }
                Err(e @ ControlError::NotFound { .. }) => return Err(e),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!(error = %e, "Guest shutdown failed, turning VM off"),
            }
        }

        self.run(uuid, stop(" -TurnOff")).await?;
        info!("VM turned off");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn restart_vm(&self, uuid: &str) -> Result<()> {
        let script = format!(
            "{}if ($vm.State.ToString() -ne 'Running') {{ throw ('{}: VM is ' + $vm.State) }}\n\
             Restart-VM -VM $vm -Force\n",
            lookup(uuid),
            INVALID_STATE_MARKER
        );
        self.run(uuid, script).await?;
        info!("VM restarted");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn delete_vm(&self, uuid: &str) -> Result<()> {
        // Only the root VHD is removed; data disks are managed separately
        let script = format!(
            "{}if ($vm.State.ToString() -ne 'Off') {{ throw ('{}: VM is ' + $vm.State) }}\n\
             $root = Get-VMHardDiskDrive -VM $vm | Sort-Object ControllerType, ControllerNumber, ControllerLocation | Select-Object -First 1 -ExpandProperty Path\n\
             Remove-VM -VM $vm -Force\n\
             if ($root -and (Test-Path $root)) {{ Remove-Item -Path $root -Force }}\n",
            lookup(uuid),
            INVALID_STATE_MARKER
        );
        self.run(uuid, script).await?;
        info!("VM deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn get_vm_info(&self, uuid: &str) -> Result<VmInfo> {
        let info: HvVmInfo = self
            .run_json(uuid, format!("{}{}", lookup(uuid), EMIT_VM_INFO))
            .await?;
        Ok(to_vm_info(info))
    }

    #[instrument(skip(self), fields(host_id = %self.host.host_id()))]
    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>> {
        let script = format!(
            "$vm = Get-VM -Name {} -ErrorAction SilentlyContinue | Select-Object -First 1\n\
             if (-not $vm) {{ 'null'; return }}\n{}",
            ps_quote(name),
            EMIT_VM_INFO
        );
        let info: Option<HvVmInfo> = self.run_json(name, script).await?;
        Ok(info.map(to_vm_info))
    }

    async fn get_vm_status(&self, uuid: &str) -> Result<PowerState> {
        let out = self
            .run(uuid, format!("{}$vm.State.ToString()\n", lookup(uuid)))
            .await?;
        Ok(parse_power_state(first_line(&out)))
    }

    #[instrument(skip(self, spec), fields(host_id = %self.host.host_id(), disk_id = %spec.disk_id))]
    async fn attach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<String> {
        self.capabilities().check_disk_format(&spec.disk_id, &spec.format)?;
        let script = format!(
            "{}$path = {}\n\
             $d = Get-VMHardDiskDrive -VM $vm | Where-Object {{ $_.Path -eq $path }} | Select-Object -First 1\n\
             if (-not $d) {{ $d = Add-VMHardDiskDrive -VM $vm -ControllerType SCSI -Path $path -Passthru }}\n\
             'scsi:{{0}}:{{1}}' -f $d.ControllerNumber, $d.ControllerLocation\n",
            lookup(uuid),
            ps_quote(&spec.source)
        );
        let out = self.run(&spec.disk_id, script).await?;
        let device = first_line(&out).to_string();
        if parse_scsi_slot(&device).is_none() {
            return Err(ControlError::internal(
                &spec.disk_id,
                format!("unexpected device slot '{}'", device),
            ));
        }
        info!(device = %device, "Disk attached");
        Ok(device)
    }

    #[instrument(skip(self, spec), fields(host_id = %self.host.host_id(), disk_id = %spec.disk_id))]
    async fn detach_disk(&self, uuid: &str, spec: &DiskAttachSpec) -> Result<()> {
        let Some(device) = spec.device.as_deref() else {
            let script = format!(
                "{}$path = {}\n\
                 $d = Get-VMHardDiskDrive -VM $vm | Where-Object {{ $_.Path -eq $path }} | Select-Object -First 1\n\
                 if (-not $d) {{ throw '{}' }}\n\
                 Remove-VMHardDiskDrive -VMHardDiskDrive $d\n",
                lookup(uuid),
                ps_quote(&spec.source),
                NOT_FOUND_MARKER
            );
            self.run(&spec.disk_id, script).await?;
            info!("Disk detached by path");
            return Ok(());
        };
        let (controller, location) = parse_scsi_slot(device)
            .ok_or_else(|| ControlError::validation(&spec.disk_id, "detach requires a scsi:<controller>:<location> slot"))?;

        let script = format!(
            "{}$d = Get-VMHardDiskDrive -VM $vm -ControllerType SCSI -ControllerNumber {} -ControllerLocation {}\n\
             if (-not $d) {{ throw '{}' }}\n\
             Remove-VMHardDiskDrive -VMHardDiskDrive $d\n",
            lookup(uuid),
            controller,
            location,
            NOT_FOUND_MARKER
        );
        self.run(&spec.disk_id, script).await?;
        info!(controller, location, "Disk detached");
        Ok(())
    }
}
