use chrono::{DateTime, SubsecRound, Utc};

/// Current time at whole-second precision.
///
/// Every timestamp we persist goes through here so that values read back
/// from the database compare equal to the ones we wrote.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}
