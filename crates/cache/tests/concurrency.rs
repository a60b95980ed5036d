use convforge_backend_gpu::testing::FakeDevice;
use convforge_backend_gpu::DeviceHandle;
use convforge_cache::{KernelCache, KernelRequest, ProgramCache};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_kernels_share_one_compile() {
    const THREADS: usize = 12;
    let fake = Arc::new(FakeDevice::new("gfx906", 60).with_compile_delay(Duration::from_millis(25)));
    let device: DeviceHandle = fake.clone();
    let cache = Arc::new(KernelCache::new(ProgramCache::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let device = Arc::clone(&device);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let request = KernelRequest::new("conv_direct_uni.cl", "conv_uni")
                    .cached_as("ConvolutionFwdDirect", format!("cfg-{}", i % 3))
                    .with_options(" -DFILTER_SIZE0=3")
                    .at_slot(i % 2);
                cache.add_kernel(&device, request).unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fake.compile_count(), 1);
    assert_eq!(cache.key_count(), 3);
    for cfg in 0..3 {
        let slots = cache.get_kernel_slots("ConvolutionFwdDirect", &format!("cfg-{cfg}"));
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(Option::is_some));
    }
}

#[test]
fn distinct_options_compile_separately_under_contention() {
    const THREADS: usize = 6;
    let fake = Arc::new(FakeDevice::new("gfx906", 60).with_compile_delay(Duration::from_millis(10)));
    let device: DeviceHandle = fake.clone();
    let cache = Arc::new(KernelCache::default());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let device = Arc::clone(&device);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let request = KernelRequest::new("pool.cl", "pooling_fwd").with_options(format!("-DVARIANT={}", i % 2));
                cache.add_kernel(&device, request).unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fake.compile_count(), 2);
    assert_eq!(cache.programs().len(), 2);
}
