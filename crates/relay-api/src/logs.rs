//! Log requests and the option rules they must satisfy.
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// A log request that cannot be served as asked.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// Both a line count and a byte count were requested.
    #[error("Both Tail and LimitBytes set. Set only one of them")]
    TailAndLimitBytes,
    /// Both a relative and an absolute start time were requested.
    #[error("Both SinceSeconds and SinceTime set. Set only one of them")]
    SinceSecondsAndSinceTime,
}

/// How to read a container's logs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContainerLogOpts {
    /// Number of lines from the end of the log. Zero means all.
    #[serde(default, rename = "Tail")]
    pub tail: i64,
    /// Number of bytes from the end of the log. Zero means all.
    #[serde(default, rename = "Bytes")]
    pub limit_bytes: i64,
    /// Prefix every line with its timestamp.
    #[serde(default, rename = "Timestamps")]
    pub timestamps: bool,
    /// Keep the stream open and follow new output.
    #[serde(default, rename = "Follow")]
    pub follow: bool,
    /// Read the previous instance of the container.
    #[serde(default, rename = "Previous")]
    pub previous: bool,
    /// Only lines newer than this many seconds.
    #[serde(default, rename = "SinceSeconds")]
    pub since_seconds: i64,
    /// Only lines newer than this time.
    #[serde(
        default,
        rename = "SinceTime",
        deserialize_with = "zero_time_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub since_time: Option<DateTime<Utc>>,
}

impl ContainerLogOpts {
    /// Check that at most one of each pair of exclusive options is set.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tail != 0 && self.limit_bytes != 0 {
            return Err(ValidationError::TailAndLimitBytes);
        }
        if self.since_seconds != 0 && self.since_time.is_some() {
            return Err(ValidationError::SinceSecondsAndSinceTime);
        }
        Ok(())
    }
}

/// Identifies the container whose logs are wanted.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogRequest {
    /// Pod namespace.
    #[serde(default, rename = "Namespace")]
    pub namespace: String,
    /// Pod UID.
    #[serde(default, rename = "PodUID")]
    pub pod_uid: String,
    /// Pod name.
    #[serde(default, rename = "PodName")]
    pub pod_name: String,
    /// Container name.
    #[serde(default, rename = "ContainerName")]
    pub container_name: String,
    /// Read options.
    #[serde(default, rename = "Opts")]
    pub opts: ContainerLogOpts,
}

impl LogRequest {
    /// Validate the request options.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.opts.validate()
    }
}

// Peers written against a zero-valued time type send 0001-01-01T00:00:00Z for
// "unset".
fn zero_time_as_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let time = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(time.filter(|t| t.year() > 1))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tail_and_limit_bytes_conflict() {
        let opts = ContainerLogOpts {
            tail: 10,
            limit_bytes: 100,
            ..Default::default()
        };
        assert_eq!(opts.validate(), Err(ValidationError::TailAndLimitBytes));
        assert_eq!(
            ValidationError::TailAndLimitBytes.to_string(),
            "Both Tail and LimitBytes set. Set only one of them"
        );
    }

    #[test]
    fn since_seconds_and_since_time_conflict() {
        let opts = ContainerLogOpts {
            since_seconds: 30,
            since_time: Some(Utc::now()),
            ..Default::default()
        };
        assert_eq!(
            opts.validate(),
            Err(ValidationError::SinceSecondsAndSinceTime)
        );
    }

    #[test]
    fn negative_values_still_conflict() {
        let request: LogRequest =
            serde_json::from_str(r#"{"Opts": {"Tail": -1, "Bytes": 20}}"#).unwrap();
        assert_eq!(request.validate(), Err(ValidationError::TailAndLimitBytes));

        let request: LogRequest = serde_json::from_str(
            r#"{"Opts": {"SinceSeconds": -5, "SinceTime": "2024-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(
            request.validate(),
            Err(ValidationError::SinceSecondsAndSinceTime)
        );
    }

    #[test]
    fn single_options_are_accepted() {
        let opts = ContainerLogOpts {
            tail: 10,
            since_seconds: 30,
            follow: true,
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
        assert!(ContainerLogOpts::default().validate().is_ok());
    }

    #[test]
    fn zero_since_time_counts_as_unset() {
        let request: LogRequest = serde_json::from_str(
            r#"{"Namespace": "ns", "PodUID": "u1", "PodName": "p1", "ContainerName": "c1",
                "Opts": {"SinceSeconds": 5, "SinceTime": "0001-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(request.opts.since_time, None);
        assert!(request.validate().is_ok());
    }
}
