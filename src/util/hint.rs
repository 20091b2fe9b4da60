/// Run `f` through a `#[cold]` call, so the optimizer lays the surrounding
/// branch out as unlikely. Used on every error path.
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
