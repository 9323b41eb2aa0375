use eventstore::ClientSettings;

use crate::Error;

/// Connection parameters for a KurrentDB node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    host: String,
    port: u16,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
}

impl ConnectionSettings {
    pub fn builder() -> ConnectionSettingsBuilder {
        ConnectionSettingsBuilder::default()
    }

    /// Reads `KURRENT_HOST`, `KURRENT_PORT`, `KURRENT_TLS`, `KURRENT_USERNAME`
    /// and `KURRENT_PASSWORD`; host and port default to `localhost:2113`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut builder = Self::builder();
        if let Some(host) = lookup("KURRENT_HOST") {
            builder = builder.host(host);
        }
        if let Some(port) = lookup("KURRENT_PORT") {
            let port = port.trim().parse().map_err(|_| {
                Error::invalid_config("KURRENT_PORT", format!("invalid port '{port}'"))
            })?;
            builder = builder.port(port);
        }
        if let Some(tls) = lookup("KURRENT_TLS") {
            let tls = tls.trim().parse().map_err(|_| {
                Error::invalid_config("KURRENT_TLS", format!("invalid flag '{tls}'"))
            })?;
            builder = builder.tls(tls);
        }
        if let Some(username) = lookup("KURRENT_USERNAME") {
            builder = builder.username(username);
        }
        if let Some(password) = lookup("KURRENT_PASSWORD") {
            builder = builder.password(password);
        }
        builder.build()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn to_connection_string(&self) -> String {
        let credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => format!("{username}:{password}@"),
            _ => String::new(),
        };
        format!(
            "esdb://{credentials}{}:{}?tls={}",
            self.host, self.port, self.tls
        )
    }

    pub(crate) fn client_settings(&self) -> Result<ClientSettings, Error> {
        Ok(self.to_connection_string().parse::<ClientSettings>()?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionSettingsBuilder {
    host: Option<String>,
    port: Option<u16>,
    tls: Option<bool>,
    username: Option<String>,
    password: Option<String>,
}

impl ConnectionSettingsBuilder {
    pub fn host(self, host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..self
        }
    }

    pub fn port(self, port: u16) -> Self {
        Self {
            port: Some(port),
            ..self
        }
    }

    pub fn tls(self, tls: bool) -> Self {
        Self {
            tls: Some(tls),
            ..self
        }
    }

    pub fn username(self, username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..self
        }
    }

    pub fn password(self, password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..self
        }
    }

    pub fn build(self) -> Result<ConnectionSettings, Error> {
        let host = self.host.unwrap_or_else(|| "localhost".to_string());
        if host.trim().is_empty() {
            return Err(Error::invalid_config("host", "host cannot be empty"));
        }
        let port = self.port.unwrap_or(2113);
        if port == 0 {
            return Err(Error::invalid_config("port", "port cannot be 0"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::invalid_config(
                "username",
                "username and password must be set together",
            ));
        }
        Ok(ConnectionSettings {
            host,
            port,
            tls: self.tls.unwrap_or(false),
            username: self.username,
            password: self.password,
        })
    }
}
