use tokio::sync::Mutex as AsyncMutex;

/// Held by tests that set or clear `LOOM_*` environment variables.
/// Use `.blocking_lock()` in sync tests and `.lock().await` in async tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());
