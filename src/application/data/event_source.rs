use derive_more::Display;

/// Initiator identity the command-line mirror attaches to change events:
/// either the filesystem watch noticed the change, or this process caused
/// it through the I/O facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EventSource {
    #[display("watch")]
    Watch,
    #[display("app")]
    Application,
}
