use blobnet::buffer::ByteBuffer;
use blobnet::message::OriginalMessage;
use blobnet::worker::WorkerHandle;
use blobnet::Result;

use crate::provider_err;

/// A VM shape and its advertised network performance, the input to the
/// engine's bandwidth-derived sizing.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub kind: String,
    pub memory_gib: f64,
    pub vcpu: u32,
    pub network_mbits: u64,
}

fn instance(kind: &str, memory_gib: f64, vcpu: u32, network_gbits: u64) -> Instance {
    Instance {
        kind: kind.to_string(),
        memory_gib,
        vcpu,
        network_mbits: network_gbits * 1_000,
    }
}

/// Network-relevant EC2 shapes.
pub fn aws_instances() -> Vec<Instance> {
    vec![
        instance("t4g.xlarge", 16.0, 4, 5),
        instance("m5.4xlarge", 64.0, 16, 10),
        instance("m5.8xlarge", 128.0, 32, 10),
        instance("m5n.4xlarge", 64.0, 16, 25),
        instance("m5n.8xlarge", 128.0, 32, 25),
        instance("m5n.16xlarge", 256.0, 64, 75),
        instance("m5n.24xlarge", 384.0, 96, 100),
        instance("c5n.4xlarge", 42.0, 16, 25),
        instance("c5n.9xlarge", 96.0, 36, 50),
        instance("c5n.18xlarge", 192.0, 72, 100),
        instance("m6i.8xlarge", 128.0, 32, 12),
        instance("m6i.16xlarge", 256.0, 64, 25),
        instance("m6i.32xlarge", 512.0, 128, 50),
    ]
}

/// Network-relevant Azure shapes.
pub fn azure_instances() -> Vec<Instance> {
    vec![
        instance("Standard_D4s_v5", 16.0, 4, 12),
        instance("Standard_D8s_v5", 32.0, 8, 12),
        instance("Standard_D16s_v5", 64.0, 16, 12),
        instance("Standard_D32s_v5", 128.0, 32, 16),
        instance("Standard_D48s_v5", 192.0, 48, 24),
        instance("Standard_D64s_v5", 256.0, 64, 30),
    ]
}

/// Network-relevant GCP shapes.
pub fn gcp_instances() -> Vec<Instance> {
    vec![
        instance("n2-standard-2", 8.0, 2, 10),
        instance("n2-standard-4", 16.0, 4, 10),
        instance("n2-standard-8", 32.0, 8, 16),
        instance("n2-standard-16", 64.0, 16, 32),
        instance("n2-standard-32", 128.0, 32, 50),
        instance("n2-standard-48", 192.0, 48, 50),
        instance("n2-standard-64", 256.0, 64, 75),
        instance("n2-standard-80", 320.0, 80, 100),
    ]
}

/// Run one plain-HTTP metadata request synchronously through the worker
/// and hand back the finished message.
pub(crate) fn fetch_metadata(
    handle: &mut WorkerHandle<'_>,
    header: ByteBuffer,
    hostname: &str,
    port: u16,
) -> Result<Box<OriginalMessage>> {
    let msg = Box::new(OriginalMessage::new(header, hostname, port, false));
    let id = handle.send_sync(msg);
    handle.process(true);
    let msg = handle
        .group()
        .receive(id)
        .ok_or_else(|| provider_err("metadata answer was not delivered"))?;
    if !msg.result.success() {
        return Err(provider_err(format!(
            "metadata request failed: {:?}",
            msg.result.failure_code()
        )));
    }
    Ok(msg)
}
