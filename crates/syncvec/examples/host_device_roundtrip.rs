use anyhow::Result;
use syncvec::{stats, DeviceId, Place, SyncedVector};
use syncvec_backend_loopback::LoopbackQueue;

fn main() -> Result<()> {
    let device = DeviceId(0);
    let queue = LoopbackQueue::register(device);

    let mut values = SyncedVector::from_slice(&[1u64, 2, 3]);
    values.push(4);
    println!("host contents: {:?}", values.to_vec());

    // A cheap copy shares storage until one side mutates.
    let mut copy = values.clone();
    println!("shared storage: {}", values.handle() == copy.handle());
    copy.write()[0] = 99;
    println!(
        "after divergence: {:?} vs {:?} (shared: {})",
        values.to_vec(),
        copy.to_vec(),
        values.handle() == copy.handle()
    );

    // Mirror the contents onto the device and write through the raw span,
    // standing in for a kernel launch.
    let span = values.device_mutable(Place::Device(device))?;
    println!("device span: {} elements at {:#x}", span.len(), span.addr());
    unsafe {
        *span.as_mut_ptr() = 7;
    }

    // The next host read syncs the device write back.
    println!("after device write: {:?}", values.to_vec());

    println!(
        "queue traffic: {} uploads, {} downloads",
        queue.host_to_device_copies(),
        queue.device_to_host_copies()
    );
    println!("process stats: {:?}", stats::snapshot());
    Ok(())
}
