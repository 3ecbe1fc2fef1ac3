//! Identifiers shared between the data sourcing workflow and the accounting
//! listener.
//!
//! Every identifier is a newtype so that a company id can never be passed
//! where a user id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_newtype!(
    /// Identifier of a single user request.
    RequestId
);
uuid_newtype!(
    /// Identifier of a shared data sourcing unit of work.
    DataSourcingId
);
uuid_newtype!(
    /// Identifier of a user.
    UserId
);
uuid_newtype!(
    /// Identifier of a company. Used both for the company data is requested
    /// about and for the organization that gets billed.
    CompanyId
);
uuid_newtype!(
    /// Identifier of a credits transaction.
    TransactionId
);

/// Name of a reporting framework such as `sfdr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Framework(pub String);

impl Framework {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Framework {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Framework {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reporting period, usually a year such as `2026`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportingPeriod(pub String);

impl ReportingPeriod {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReportingPeriod {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ReportingPeriod {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The (company, framework, reporting period) triple that identifies one
/// piece of reportable work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcingTriple {
    pub company_id: CompanyId,
    pub framework: Framework,
    pub reporting_period: ReportingPeriod,
}

impl SourcingTriple {
    pub fn new(
        company_id: CompanyId,
        framework: impl Into<Framework>,
        reporting_period: impl Into<ReportingPeriod>,
    ) -> Self {
        Self {
            company_id,
            framework: framework.into(),
            reporting_period: reporting_period.into(),
        }
    }
}

impl fmt::Display for SourcingTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.company_id, self.framework, self.reporting_period
        )
    }
}

/// Framework restriction used by queries.
///
/// `Unrestricted` matches every framework. It replaces a nullable framework
/// column whose null value meant "all frameworks".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "framework", rename_all = "camelCase")]
pub enum FrameworkFilter {
    #[default]
    Unrestricted,
    Specific(Framework),
}

impl FrameworkFilter {
    pub fn matches(&self, framework: &Framework) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Specific(expected) => expected == framework,
        }
    }
}

impl From<Option<Framework>> for FrameworkFilter {
    fn from(framework: Option<Framework>) -> Self {
        framework.map_or(Self::Unrestricted, Self::Specific)
    }
}
