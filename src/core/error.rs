use crate::core::rules::IpFamily;
use crate::netlink::NetlinkError;
use thiserror::Error;

/// Core error types for meshfw
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration or probe address; nothing was mutated
    #[error("Configuration error in {field}: {message}")]
    Config { field: String, message: String },

    /// An iptables command failed; every earlier command has already taken effect
    #[error("{family} command `{command}` failed: {message}")]
    Execution {
        family: IpFamily,
        command: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
        /// Commands issued for this family, the failing one included
        attempted: usize,
        /// Those commands in order; all but the last took effect
        journal: Vec<String>,
    },

    /// Policy routing through the namespace netlink handle failed
    #[error("{family} netlink error: {source}")]
    Netlink {
        family: IpFamily,
        #[source]
        source: NetlinkError,
    },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stderr of a failed command, when there was one
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::Execution { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables/iproute2 error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify netfilter rules")
                .with_suggestion("Run the agent as root or grant it CAP_NET_ADMIN")
                .with_suggestion("Check that the target network namespace path is readable");
        }

        // Missing xtables extension (TPROXY, CT, set, owner ...)
        if lower.contains("no chain/target/match by that name")
            || lower.contains("couldn't load target")
            || lower.contains("couldn't load match")
        {
            return ErrorTranslation::new("A required netfilter extension is not available")
                .with_suggestion("Load the kernel modules: modprobe xt_TPROXY xt_CT xt_owner xt_set")
                .with_suggestion("Check that the node kernel ships nf_tproxy and xt_connmark");
        }

        // ip6tables tables unavailable
        if lower.contains("can't initialize ip6tables table")
            || lower.contains("address family not supported")
        {
            return ErrorTranslation::new("IPv6 netfilter is not available on this node")
                .with_suggestion("Load ip6table_mangle, ip6table_nat and ip6table_raw")
                .with_suggestion("Or set enable_ipv6 to false in the configuration");
        }

        // Generic table init failure
        if lower.contains("can't initialize iptables table") {
            return ErrorTranslation::new("An iptables table could not be initialized")
                .with_suggestion("Load the table module: modprobe iptable_mangle iptable_nat iptable_raw")
                .with_suggestion("Check whether the node uses the nft or legacy iptables backend");
        }

        // Missing ipset on the host
        if lower.contains("set") && lower.contains("doesn't exist") {
            return ErrorTranslation::new("The probe ipset does not exist on the host")
                .with_suggestion("Create it before installing host rules: ipset create <name> hash:ip")
                .with_suggestion("Check probe_ipset_v4/probe_ipset_v6 in the configuration");
        }

        // Lock contention
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Retry; the rule set is safe to re-apply")
                .with_suggestion("Check for other agents rewriting netfilter rules on this node");
        }

        // Missing binaries
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables, ip6tables, ip or nsenter not found in PATH")
                .with_suggestion("Install iptables and iproute2 in the agent image")
                .with_suggestion("nsenter is provided by util-linux");
        }

        // Routing already present is normally tolerated; seen here it means a conflict
        if lower.contains("file exists") {
            return ErrorTranslation::new("A conflicting policy rule or route already exists")
                .with_suggestion("Inspect the namespace with: ip rule show; ip route show table all");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Netfilter error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Re-running the same command is safe once the cause is fixed")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
