/// Interface to something that takes over a thread and emulates until it
/// halts.
pub trait Backend {
    /// Run until the emulated system stops. This blocks the calling thread.
    fn run(&mut self) -> anyhow::Result<()>;
}
