use filament::InitFlags;

/// Run `f` inside a fresh runtime on the current thread.
pub fn run(f: impl FnOnce()) {
    filament::init(InitFlags::default()).unwrap();
    f();
    filament::fini().unwrap();
}
