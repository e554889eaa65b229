//! Structured operations over the nvme CLI: target discovery, connect,
//! disconnect and enumeration of the fabric devices the kernel knows
//! about.

use serde::Deserialize;
use snafu::ResultExt;

use crate::{
    error::{self, Error},
    executor::Executor,
};

const NVME_BINARY: &str = "nvme";

/// Fabric transport used for all target connections.
pub const DEFAULT_TRANSPORT_TYPE: &str = "tcp";

/// Controller state of a usable fabric path.
const CONTROLLER_STATE_LIVE: &str = "live";

/// One subsystem as reported by `nvme list -v -o json`: the controllers
/// attached to it and the namespaces it exposes.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NvmeDevice {
    #[serde(rename = "Subsystem")]
    pub subsystem: String,
    #[serde(rename = "SubsystemNQN")]
    pub subsystem_nqn: String,
    #[serde(rename = "Controllers")]
    pub controllers: Vec<NvmeController>,
    #[serde(rename = "Namespaces")]
    pub namespaces: Vec<NvmeNamespace>,
}

/// A host-side controller instance attached over a transport. The address
/// carries `traddr=X trsvcid=Y`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NvmeController {
    #[serde(rename = "Controller")]
    pub controller: String,
    #[serde(rename = "Transport")]
    pub transport: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "HostNQN")]
    pub host_nqn: String,
    #[serde(rename = "HostID")]
    pub host_id: String,
    #[serde(rename = "Firmware")]
    pub firmware: String,
    #[serde(rename = "ModelNumber")]
    pub model_number: String,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "Namespaces")]
    pub namespaces: Vec<NvmeNamespace>,
}

/// A namespace: the actual block device, identified by NSID and kernel
/// name.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NvmeNamespace {
    #[serde(rename = "NameSpace")]
    pub name_space: String,
    #[serde(rename = "NSID")]
    pub nsid: u32,
    #[serde(rename = "UsedBytes")]
    pub used_bytes: u64,
    #[serde(rename = "MaximumLBA")]
    pub maximum_lba: u64,
    #[serde(rename = "PhysicalSize")]
    pub physical_size: u64,
    #[serde(rename = "SectorSize")]
    pub sector_size: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NvmeList {
    #[serde(rename = "Devices")]
    devices: Vec<NvmeDevice>,
}

#[derive(Debug, Deserialize)]
struct ConnectOutput {
    device: String,
}

/// Probe that the nvme CLI is present at all.
pub async fn check_nvme_cli(executor: &Executor) -> Result<(), Error> {
    executor
        .execute(NVME_BINARY, ["--version"])
        .await
        .map(|_| ())
}

/// Discover the subsystem NQN served on the given address and port.
pub async fn discover_target(
    traddr: &str,
    trsvcid: &str,
    executor: &Executor,
) -> Result<String, Error> {
    // A valid output is like below:
    //   Discovery Log Number of Records 1, Generation counter 1
    //   =====Discovery Log Entry 0======
    //   trtype:  tcp
    //   adrfam:  ipv4
    //   subtype: nvme subsystem
    //   treq:    not required
    //   portid:  0
    //   trsvcid: 4520
    //   subnqn:  nqn.2023-01.io.blkbridge:vol-1
    //   traddr:  127.0.0.1
    //   sectype: none
    let output = executor
        .execute(
            NVME_BINARY,
            [
                "discover",
                "-t",
                DEFAULT_TRANSPORT_TYPE,
                "-a",
                traddr,
                "-s",
                trsvcid,
            ],
        )
        .await?;

    parse_discovered_subnqn(&output).ok_or_else(|| Error::DiscoveryEmpty {
        traddr: traddr.to_string(),
        trsvcid: trsvcid.to_string(),
    })
}

/// First `subnqn:` line of the discovery log.
fn parse_discovered_subnqn(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("subnqn:"))
        .map(|nqn| nqn.trim().to_string())
        .filter(|nqn| !nqn.is_empty())
}

/// Connect to the subsystem at the given address. Idempotent: an existing
/// live controller for the triple is returned without invoking connect
/// (re-connecting an attached subsystem exits with code 114).
pub async fn connect_target(
    traddr: &str,
    trsvcid: &str,
    nqn: &str,
    executor: &Executor,
) -> Result<String, Error> {
    if let Ok(devices) = get_devices(Some(traddr), Some(trsvcid), Some(nqn), executor).await {
        if let Some(controller) = devices.first().and_then(|device| device.controllers.first()) {
            return Ok(controller.controller.clone());
        }
    }

    // The output example:
    // {
    //  "device" : "nvme0"
    // }
    let output = executor
        .execute(
            NVME_BINARY,
            [
                "connect",
                "-t",
                DEFAULT_TRANSPORT_TYPE,
                "-a",
                traddr,
                "-s",
                trsvcid,
                "--nqn",
                nqn,
                "-o",
                "json",
            ],
        )
        .await?;

    let parsed: ConnectOutput =
        serde_json::from_str(&output).context(error::JsonOutputSnafu {
            program: NVME_BINARY,
        })?;
    Ok(parsed.device)
}

/// Disconnect every controller of the subsystem.
pub async fn disconnect_target(nqn: &str, executor: &Executor) -> Result<(), Error> {
    // The output example:
    // NQN:nqn.2023-01.io.blkbridge:vol-1 disconnected 1 controller(s)
    executor
        .execute(NVME_BINARY, ["disconnect", "--nqn", nqn])
        .await
        .map(|_| ())
}

/// Enumerate fabric devices, filtered by whichever of address, port and
/// nqn are given.
pub async fn get_devices(
    traddr: Option<&str>,
    trsvcid: Option<&str>,
    nqn: Option<&str>,
    executor: &Executor,
) -> Result<Vec<NvmeDevice>, Error> {
    let output = executor
        .execute(NVME_BINARY, ["list", "-v", "-o", "json"])
        .await?;
    let list: NvmeList = serde_json::from_str(&output).context(error::JsonOutputSnafu {
        program: NVME_BINARY,
    })?;
    filter_devices(list.devices, traddr, trsvcid, nqn)
}

/// A controller is valid for the triple when its address carries the
/// expected `traddr=` prefix and ` trsvcid=` suffix and the path is live.
fn controller_matches(controller: &NvmeController, prefix: &str, suffix: &str) -> bool {
    controller.address.starts_with(prefix)
        && controller.address.ends_with(suffix)
        && controller.state == CONTROLLER_STATE_LIVE
}

fn filter_devices(
    devices: Vec<NvmeDevice>,
    traddr: Option<&str>,
    trsvcid: Option<&str>,
    nqn: Option<&str>,
) -> Result<Vec<NvmeDevice>, Error> {
    let Some(nqn) = nqn else {
        return Ok(devices);
    };

    let prefix = traddr
        .map(|addr| format!("traddr={} ", addr))
        .unwrap_or_default();
    let suffix = trsvcid
        .map(|svc| format!(" trsvcid={}", svc))
        .unwrap_or_default();

    // A same-nqn path that matches the address but is not live is worth
    // telling apart from "nothing there at all".
    let mut broken: Option<(String, String)> = None;
    let mut matched = Vec::new();

    for device in devices {
        if device.subsystem_nqn != nqn {
            continue;
        }
        for controller in &device.controllers {
            if controller.address.starts_with(&prefix)
                && controller.address.ends_with(&suffix)
                && controller.state != CONTROLLER_STATE_LIVE
            {
                broken.get_or_insert((
                    controller.controller.clone(),
                    controller.state.clone(),
                ));
            }
        }
        if device.namespaces.is_empty() {
            continue;
        }
        if device
            .controllers
            .iter()
            .any(|controller| controller_matches(controller, &prefix, &suffix))
        {
            matched.push(device);
        }
    }

    if matched.is_empty() {
        return match broken {
            Some((controller, state)) => error::ControllerNotLiveSnafu {
                nqn,
                controller,
                state,
            }
            .fail(),
            None => error::ValidNvmeDeviceNotFoundSnafu {
                nqn,
                traddr: traddr.unwrap_or_default(),
                trsvcid: trsvcid.unwrap_or_default(),
            }
            .fail(),
        };
    }
    Ok(matched)
}

/// Split a controller address of the form `traddr=127.0.0.1 trsvcid=4420`
/// (comma separated on some kernels) into address and service id.
pub fn split_controller_address(address: &str) -> (String, String) {
    let mut traddr = String::new();
    let mut trsvcid = String::new();
    for part in address.split(|c| c == ',' || c == ' ') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("traddr=") {
            traddr = value.to_string();
        } else if let Some(value) = part.strip_prefix("trsvcid=") {
            trsvcid = value.to_string();
        }
    }
    (traddr, trsvcid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCOVERY_LOG: &str = "\
Discovery Log Number of Records 1, Generation counter 1
=====Discovery Log Entry 0======
trtype:  tcp
adrfam:  ipv4
subtype: nvme subsystem
treq:    not required
portid:  0
trsvcid: 4520
subnqn:  nqn.2023-01.io.blkbridge:vol-1
traddr:  127.0.0.1
sectype: none
";

    #[test]
    fn discovery_log_scan() {
        assert_eq!(
            parse_discovered_subnqn(DISCOVERY_LOG).unwrap(),
            "nqn.2023-01.io.blkbridge:vol-1"
        );
        assert!(parse_discovered_subnqn("Discovery Log Number of Records 0\n").is_none());
        assert!(parse_discovered_subnqn("subnqn:   \n").is_none());
    }

    fn device(nqn: &str, address: &str, state: &str, with_namespace: bool) -> NvmeDevice {
        NvmeDevice {
            subsystem: "nvme-subsys0".into(),
            subsystem_nqn: nqn.into(),
            controllers: vec![NvmeController {
                controller: "nvme0".into(),
                transport: DEFAULT_TRANSPORT_TYPE.into(),
                address: address.into(),
                state: state.into(),
                ..Default::default()
            }],
            namespaces: if with_namespace {
                vec![NvmeNamespace {
                    name_space: "nvme0n1".into(),
                    nsid: 1,
                    ..Default::default()
                }]
            } else {
                vec![]
            },
        }
    }

    const NQN: &str = "nqn.2023-01.io.blkbridge:vol-1";
    const ADDRESS: &str = "traddr=127.0.0.1 trsvcid=4520";

    #[test]
    fn filter_picks_the_live_matching_path() {
        let devices = vec![
            device("nqn.2023-01.io.blkbridge:other", ADDRESS, "live", true),
            device(NQN, ADDRESS, "live", true),
        ];
        let matched =
            filter_devices(devices, Some("127.0.0.1"), Some("4520"), Some(NQN)).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].subsystem_nqn, NQN);
    }

    #[test]
    fn filter_rejects_wrong_address() {
        let devices = vec![device(NQN, "traddr=10.0.0.9 trsvcid=4520", "live", true)];
        let err = filter_devices(devices, Some("127.0.0.1"), Some("4520"), Some(NQN))
            .unwrap_err();
        assert!(err.is_valid_nvme_device_not_found());
    }

    #[test]
    fn filter_names_the_broken_path() {
        let devices = vec![device(NQN, ADDRESS, "connecting", true)];
        let err = filter_devices(devices, Some("127.0.0.1"), Some("4520"), Some(NQN))
            .unwrap_err();
        match err {
            Error::ControllerNotLive {
                controller, state, ..
            } => {
                assert_eq!(controller, "nvme0");
                assert_eq!(state, "connecting");
            }
            other => panic!("wrong error type: {}", other),
        }
        // "There but broken" is not "not there".
        let devices = vec![device(NQN, ADDRESS, "connecting", true)];
        let err = filter_devices(devices, Some("127.0.0.1"), Some("4520"), Some(NQN))
            .unwrap_err();
        assert!(!err.is_valid_nvme_device_not_found());
    }

    #[test]
    fn filter_skips_subsystems_without_namespaces() {
        let devices = vec![device(NQN, ADDRESS, "live", false)];
        let err = filter_devices(devices, Some("127.0.0.1"), Some("4520"), Some(NQN))
            .unwrap_err();
        assert!(err.is_valid_nvme_device_not_found());
    }

    #[test]
    fn filter_without_nqn_passes_everything() {
        let devices = vec![
            device(NQN, ADDRESS, "live", true),
            device("nqn.other", ADDRESS, "connecting", false),
        ];
        assert_eq!(filter_devices(devices, None, None, None).unwrap().len(), 2);
    }

    #[test]
    fn controller_address_parts() {
        assert_eq!(
            split_controller_address("traddr=127.0.0.1 trsvcid=4520"),
            ("127.0.0.1".to_string(), "4520".to_string())
        );
        assert_eq!(
            split_controller_address("traddr=10.1.2.3,trsvcid=4420"),
            ("10.1.2.3".to_string(), "4420".to_string())
        );
        assert_eq!(
            split_controller_address(""),
            (String::new(), String::new())
        );
    }

    #[test]
    fn list_output_decodes() {
        let output = r#"{
  "Devices" : [
    {
      "Subsystem" : "nvme-subsys0",
      "SubsystemNQN" : "nqn.2023-01.io.blkbridge:vol-1",
      "Controllers" : [
        {
          "Controller" : "nvme0",
          "Transport" : "tcp",
          "Address" : "traddr=127.0.0.1 trsvcid=4520",
          "State" : "live",
          "HostNQN" : "nqn.2014-08.org.nvmexpress:uuid:f9851252-f382-4eb8-af24-a5fbd875157a",
          "HostID" : "d9bcbe5a-ecad-4dc7-bd65-babcc0f990bd",
          "Firmware" : "23.05",
          "ModelNumber" : "SPDK bdev Controller",
          "SerialNumber" : "00000000000000000000",
          "Namespaces" : [
            {
              "NameSpace" : "nvme0c0n1",
              "NSID" : 1,
              "UsedBytes" : 0,
              "MaximumLBA" : 0,
              "PhysicalSize" : 0,
              "SectorSize" : 1
            }
          ]
        }
      ],
      "Namespaces" : [
        {
          "NameSpace" : "nvme0n1",
          "NSID" : 1,
          "UsedBytes" : 4194304,
          "MaximumLBA" : 1024,
          "PhysicalSize" : 4194304,
          "SectorSize" : 4096
        }
      ]
    }
  ]
}"#;
        let list: NvmeList = serde_json::from_str(output).unwrap();
        assert_eq!(list.devices.len(), 1);
        let device = &list.devices[0];
        assert_eq!(device.subsystem_nqn, "nqn.2023-01.io.blkbridge:vol-1");
        assert_eq!(device.controllers[0].state, "live");
        assert_eq!(device.namespaces[0].name_space, "nvme0n1");
        assert_eq!(device.namespaces[0].sector_size, 4096);
    }
}
