/// Minimum severity of validation-layer messages forwarded to `tracing`.
///
/// Variants are ordered least-to-most severe. Passing `None` wherever an
/// `Option<VulkanLogLevel>` is accepted disables the validation layer.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}
