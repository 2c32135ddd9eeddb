use crate::error::BusError;

/// Protocol version this build of the bus speaks unless configured otherwise.
pub const DEFAULT_PROTOCOL: &str = "v2";

/// Check that `supported` (declared by a plugin factory or a test worker)
/// contains the `required` version.
///
/// Returns the negotiated version on success.
pub fn negotiate<S: AsRef<str>>(
    filename: &str,
    required: &str,
    supported: &[S],
) -> Result<String, BusError> {
    let required = required.trim();
    if supported.iter().any(|version| version.as_ref().trim() == required) {
        tracing::debug!(filename, protocol = required, "Negotiated shared worker protocol");
        return Ok(required.to_string());
    }

    Err(BusError::ProtocolMismatch {
        filename: filename.to_string(),
        required: required.to_string(),
        supported: supported
            .iter()
            .map(|version| version.as_ref().to_string())
            .collect(),
    })
}
