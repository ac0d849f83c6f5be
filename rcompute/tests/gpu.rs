//! Tests against a real Vulkan implementation.
//!
//! Each test returns early with a message when no Vulkan device is present.
//! Kernel tests also need the compiled saxpy shader: set `RCOMPUTE_SAXPY_SPV`
//! or run `cargo xtask shaders` first.
//!
//! The timeout tests use a device whose wait timeout is zero, so almost every
//! fence wait gives up while the work is still queued. When a GPU finishes
//! before the first poll anyway, those tests have nothing to observe and
//! return early.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rcompute::ash::vk;
use rcompute::buffer::{BufferAccessError, CreateBufferError};
use rcompute::kernel::{BindKernelError, DispatchError, RunKernelError};
use rcompute::transfer::TransferError;
use rcompute::{
    BufferDesc, ComputeKernel, Device, DeviceBuffer, DeviceConfig, Instance,
    KernelParams,
};

const WIDTH: u32 = 90;
const HEIGHT: u32 = 60;
const LEN: usize = (WIDTH * HEIGHT) as usize;

fn device() -> Option<Arc<Device>> {
    device_with(&DeviceConfig::default())
}

fn impatient_device() -> Option<Arc<Device>> {
    device_with(&DeviceConfig {
        wait_timeout: Some(Duration::ZERO),
        ..DeviceConfig::default()
    })
}

fn device_with(config: &DeviceConfig) -> Option<Arc<Device>> {
    // SAFETY: loads the system Vulkan loader, as any Vulkan test must.
    let instance = match unsafe { Instance::new("rcompute-tests", None) } {
        Ok(instance) => Arc::new(instance),
        Err(e) => {
            eprintln!("skipping: no Vulkan instance ({e})");
            return None;
        }
    };
    match Device::new(&instance, config) {
        Ok(device) => Some(Arc::new(device)),
        Err(e) => {
            eprintln!("skipping: no usable Vulkan device ({e})");
            None
        }
    }
}

fn shader_path() -> PathBuf {
    std::env::var_os("RCOMPUTE_SAXPY_SPV")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("../out/shaders/saxpy.spv")
        })
}

fn kernel(device: &Arc<Device>) -> Option<ComputeKernel> {
    let path = shader_path();
    if !path.exists() {
        eprintln!("skipping: compiled shader not found at {path:?}");
        return None;
    }
    Some(ComputeKernel::from_file(device, &path).expect("kernel builds"))
}

fn staging_capable() -> BufferDesc<'static> {
    BufferDesc::default().with_usage(
        vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST,
    )
}

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| i as f32 * 0.5).collect()
}

#[test]
fn round_trip_direct() {
    let Some(device) = device() else { return };
    let data = ramp(LEN);
    let buffer = DeviceBuffer::from_host(&device, &data, BufferDesc::host_visible())
        .expect("upload");
    assert!(buffer.is_host_visible());
    assert_eq!(buffer.len(), LEN);
    assert_eq!(buffer.to_vec().expect("download"), data);
}

#[test]
fn round_trip_staged() {
    let Some(device) = device() else { return };
    let data = ramp(LEN);
    let mut buffer =
        DeviceBuffer::<f32>::new(&device, LEN, staging_capable()).expect("alloc");
    buffer.write_staged(&data).expect("staged upload");
    let mut out = vec![0.0; LEN];
    buffer.read_staged(&mut out).expect("staged download");
    assert_eq!(out, data);
}

#[test]
fn round_trip_automatic_device_local() {
    let Some(device) = device() else { return };
    let data = ramp(LEN);
    let buffer = DeviceBuffer::from_host(&device, &data, staging_capable())
        .expect("upload");
    let mut out = vec![42.0; 3];
    buffer.to_host(&mut out).expect("download");
    assert_eq!(out, data);
}

#[test]
fn staged_and_direct_paths_agree() {
    let Some(device) = device() else { return };
    let data = ramp(257);
    let desc = BufferDesc::host_visible().with_usage(
        vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST,
    );

    let mut direct = DeviceBuffer::<f32>::new(&device, data.len(), desc).expect("alloc");
    let mut staged = DeviceBuffer::<f32>::new(&device, data.len(), desc).expect("alloc");
    direct.write_mapped(&data).expect("direct write");
    staged.write_staged(&data).expect("staged write");

    let mut a = vec![0.0; data.len()];
    let mut b = vec![0.0; data.len()];
    direct.read_staged(&mut a).expect("staged read");
    staged.read_mapped(&mut b).expect("direct read");
    assert_eq!(a, b);
    assert_eq!(a, data);
}

#[test]
fn wait_idle_alongside_submissions() {
    let Some(device) = device() else { return };
    let data = ramp(1024);

    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..50 {
                device.wait_idle().expect("wait idle");
            }
        });
        for _ in 0..50 {
            let mut buffer =
                DeviceBuffer::<f32>::new(&device, data.len(), staging_capable())
                    .expect("alloc");
            buffer.write_staged(&data).expect("staged upload");
        }
    });
}

#[test]
fn zero_sized_buffer_is_rejected() {
    let Some(device) = device() else { return };
    let err = DeviceBuffer::<f32>::new(&device, 0, BufferDesc::default())
        .expect_err("zero-sized buffer");
    assert!(matches!(err, CreateBufferError::ZeroSized));

    let err = DeviceBuffer::<f32>::from_host(&device, &[], BufferDesc::host_visible())
        .expect_err("empty upload");
    assert!(matches!(
        err,
        BufferAccessError::Create(CreateBufferError::ZeroSized)
    ));
}

#[test]
fn length_mismatch_is_rejected() {
    let Some(device) = device() else { return };
    let mut buffer =
        DeviceBuffer::<f32>::new(&device, 8, BufferDesc::host_visible()).expect("alloc");
    let err = buffer.write_mapped(&[1.0; 4]).expect_err("short write");
    assert!(matches!(
        err,
        BufferAccessError::LengthMismatch {
            expected: 8,
            actual: 4
        }
    ));
}

#[test]
fn saxpy_computes_expected_values() {
    let Some(device) = device() else { return };
    let Some(mut kernel) = kernel(&device) else { return };

    for desc in [BufferDesc::host_visible(), staging_capable()] {
        let mut y = DeviceBuffer::from_host(&device, &vec![0.71f32; LEN], desc)
            .expect("upload y");
        let x = DeviceBuffer::from_host(&device, &vec![0.65f32; LEN], desc)
            .expect("upload x");

        kernel
            .dispatch(&mut y, &x, KernelParams::new(WIDTH, HEIGHT, 2.0))
            .expect("dispatch");

        let out = y.to_vec().expect("download");
        assert_eq!(out.len(), LEN);
        for (i, v) in out.iter().enumerate() {
            assert!((v - 2.01).abs() < 1e-5, "element {i} is {v}");
        }
    }
}

#[test]
fn run_without_bind_is_not_bound() {
    let Some(device) = device() else { return };
    let Some(mut kernel) = kernel(&device) else { return };

    // SAFETY: nothing is bound, so no buffers are referenced.
    let err = unsafe { kernel.run() }.expect_err("unbound run");
    assert!(matches!(err, RunKernelError::NotBound));

    let mut y = DeviceBuffer::from_host(&device, &[1.0f32; 256], BufferDesc::host_visible())
        .expect("upload y");
    let x = DeviceBuffer::from_host(&device, &[1.0f32; 256], BufferDesc::host_visible())
        .expect("upload x");
    kernel
        .dispatch(&mut y, &x, KernelParams::new(16, 16, 1.0))
        .expect("dispatch");
    assert!(!kernel.is_bound());

    // SAFETY: the recording was consumed by the dispatch above.
    let err = unsafe { kernel.run() }.expect_err("consumed recording");
    assert!(matches!(err, RunKernelError::NotBound));
}

#[test]
fn rebinding_replaces_the_recording() {
    let Some(device) = device() else { return };
    let Some(mut kernel) = kernel(&device) else { return };

    let y = DeviceBuffer::from_host(&device, &[0.0f32; 256], BufferDesc::host_visible())
        .expect("upload y");
    let x_ones = DeviceBuffer::from_host(&device, &[1.0f32; 256], BufferDesc::host_visible())
        .expect("upload x");
    let x_twos = DeviceBuffer::from_host(&device, &[2.0f32; 256], BufferDesc::host_visible())
        .expect("upload x");

    let params = KernelParams::new(16, 16, 1.0);
    kernel.bind_parameters(&y, &x_ones, params).expect("bind");
    kernel.bind_parameters(&y, &x_twos, params).expect("rebind");
    // SAFETY: y and x_twos outlive the call.
    unsafe { kernel.run() }.expect("run");

    assert!(y.to_vec().expect("download").iter().all(|&v| v == 2.0));
}

#[test]
fn bind_validates_grid_and_buffer_sizes() {
    let Some(device) = device() else { return };
    let Some(mut kernel) = kernel(&device) else { return };

    let small = DeviceBuffer::from_host(&device, &[0.0f32; 100], BufferDesc::host_visible())
        .expect("upload");
    let large = DeviceBuffer::from_host(&device, &[0.0f32; 400], BufferDesc::host_visible())
        .expect("upload");

    let err = kernel
        .bind_parameters(&large, &small, KernelParams::new(20, 20, 1.0))
        .expect_err("input too small");
    assert!(matches!(
        err,
        BindKernelError::BufferTooSmall {
            binding: 1,
            len: 100,
            required: 400
        }
    ));
    assert!(!kernel.is_bound());

    let err = kernel
        .bind_parameters(&large, &large, KernelParams::new(0, 20, 1.0))
        .expect_err("empty grid");
    assert!(matches!(err, BindKernelError::EmptyDispatch { width: 0, .. }));

    let mut large = large;
    let err = kernel
        .dispatch(&mut large, &small, KernelParams::new(20, 20, 1.0))
        .expect_err("dispatch validates too");
    assert!(matches!(
        err,
        DispatchError::Bind(BindKernelError::BufferTooSmall { .. })
    ));
}

const BIG: u32 = 2048;
const BIG_LEN: usize = (BIG * BIG) as usize;

/// Dispatch saxpy over a large grid on `kernel`. `None` when the GPU beat
/// the zero timeout.
fn dispatch_until_timeout(
    kernel: &mut ComputeKernel,
    y: &mut DeviceBuffer<f32>,
    x: &DeviceBuffer<f32>,
) -> Option<()> {
    match kernel.dispatch(y, x, KernelParams::new(BIG, BIG, 2.0)) {
        Ok(()) => {
            eprintln!("skipping: dispatch finished before the first poll");
            None
        }
        Err(DispatchError::Run(RunKernelError::Timeout)) => Some(()),
        Err(e) => panic!("unexpected dispatch error: {e}"),
    }
}

#[test]
fn timed_out_dispatch_holds_buffer_drops_until_idle() {
    let Some(device) = impatient_device() else { return };
    let Some(mut kernel) = kernel(&device) else { return };

    let mut y = DeviceBuffer::from_host(&device, &vec![0.71f32; BIG_LEN], BufferDesc::host_visible())
        .expect("upload y");
    let x = DeviceBuffer::from_host(&device, &vec![0.65f32; BIG_LEN], BufferDesc::host_visible())
        .expect("upload x");
    assert!(!device.has_abandoned_work());

    if dispatch_until_timeout(&mut kernel, &mut y, &x).is_none() {
        return;
    }
    assert!(device.has_abandoned_work());

    // The dispatch still reads x; dropping it must wait for the device.
    drop(x);
    assert!(!device.has_abandoned_work());

    let out = y.to_vec().expect("download");
    assert!(out.iter().all(|v| (v - 2.01).abs() < 1e-5));
}

#[test]
fn next_bind_retires_a_timed_out_dispatch() {
    let Some(device) = impatient_device() else { return };
    let Some(mut kernel) = kernel(&device) else { return };

    let mut y = DeviceBuffer::from_host(&device, &vec![0.0f32; BIG_LEN], BufferDesc::host_visible())
        .expect("upload y");
    let x = DeviceBuffer::from_host(&device, &vec![1.0f32; BIG_LEN], BufferDesc::host_visible())
        .expect("upload x");
    if dispatch_until_timeout(&mut kernel, &mut y, &x).is_none() {
        return;
    }

    let small_y = DeviceBuffer::from_host(&device, &[0.0f32; 256], BufferDesc::host_visible())
        .expect("upload");
    let small_x = DeviceBuffer::from_host(&device, &[1.0f32; 256], BufferDesc::host_visible())
        .expect("upload");
    let params = KernelParams::new(16, 16, 1.0);

    match kernel.bind_parameters(&small_y, &small_x, params) {
        Ok(()) => assert!(kernel.is_bound()),
        Err(BindKernelError::PreviousDispatchPending) => assert!(!kernel.is_bound()),
        Err(e) => panic!("unexpected bind error: {e}"),
    }

    device.wait_idle().expect("wait idle");
    kernel
        .bind_parameters(&small_y, &small_x, params)
        .expect("bind once the previous dispatch finished");
    assert!(kernel.is_bound());
}

#[test]
fn kernel_dropped_mid_dispatch_then_buffers() {
    let Some(device) = impatient_device() else { return };
    let Some(mut kernel) = kernel(&device) else { return };

    let mut y = DeviceBuffer::from_host(&device, &vec![0.0f32; BIG_LEN], BufferDesc::host_visible())
        .expect("upload y");
    let x = DeviceBuffer::from_host(&device, &vec![1.0f32; BIG_LEN], BufferDesc::host_visible())
        .expect("upload x");
    if dispatch_until_timeout(&mut kernel, &mut y, &x).is_none() {
        return;
    }

    drop(kernel);
    drop(y);
    drop(x);
    assert!(!device.has_abandoned_work());
}

#[test]
fn timed_out_copy_is_reported_and_settled() {
    let Some(device) = impatient_device() else { return };
    let data = ramp(BIG_LEN);

    let mut buffer =
        DeviceBuffer::<f32>::new(&device, BIG_LEN, staging_capable()).expect("alloc");
    match buffer.write_staged(&data) {
        Ok(()) => {
            eprintln!("skipping: copy finished before the first poll");
            return;
        }
        Err(BufferAccessError::Transfer(TransferError::Timeout)) => {}
        Err(e) => panic!("unexpected upload error: {e}"),
    }
    assert!(device.has_abandoned_work());

    // The copy may still be writing into `buffer`.
    drop(buffer);
    assert!(!device.has_abandoned_work());

    match DeviceBuffer::from_host(&device, &data, staging_capable()) {
        Ok(buffer) => assert_eq!(buffer.len(), BIG_LEN),
        Err(BufferAccessError::Transfer(TransferError::Timeout)) => {
            assert!(device.has_abandoned_work());
        }
        Err(e) => panic!("unexpected upload error: {e}"),
    }
}
