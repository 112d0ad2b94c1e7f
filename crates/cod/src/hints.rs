use crate::error::Error;

/// Caller-declared facts about an instance, taken at face value until the
/// file is actually read. Say an inventory report of a bucket carries
/// (uri, size, crc32c) per file: providing them here lets the engine drop a
/// duplicate without fetching it. On the first real read every set field is
/// compared against the truth, and any mismatch is a hard error.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Hints {
    pub size: Option<u64>,
    pub crc32c: Option<String>,
    pub instance_uid: Option<String>,
    pub series_uid: Option<String>,
    pub study_uid: Option<String>,
}

impl Hints {
    pub(crate) fn validate(
        &self,
        true_size: u64,
        true_crc32c: &str,
        true_instance_uid: &str,
        true_series_uid: &str,
        true_study_uid: &str,
    ) -> Result<(), Error> {
        if let Some(size) = self.size {
            if size != true_size {
                return Err(Error::HintMismatch {
                    field: "size",
                    hint: size.to_string(),
                    actual: true_size.to_string(),
                });
            }
        }
        check("crc32c", self.crc32c.as_deref(), true_crc32c)?;
        check(
            "instance uid",
            self.instance_uid.as_deref(),
            true_instance_uid,
        )?;
        check("series uid", self.series_uid.as_deref(), true_series_uid)?;
        check("study uid", self.study_uid.as_deref(), true_study_uid)?;
        Ok(())
    }
}

fn check(field: &'static str, hint: Option<&str>, actual: &str) -> Result<(), Error> {
    match hint {
        Some(h) if h != actual => Err(Error::HintMismatch {
            field,
            hint: h.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}
