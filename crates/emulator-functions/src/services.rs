// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event service registrars.
//!
//! Each background trigger is registered with the companion emulator that
//! produces its events. Registrars are looked up by [`EventService`]; adding
//! a service means adding a registrar to [`RegistrarTable::standard`].
//!
//! | Service   | Registration                                            |
//! |-----------|---------------------------------------------------------|
//! | firestore | `PUT /emulator/v1/projects/{p}/triggers/{key}`          |
//! | database  | `POST /.settings/functionTriggers.json?ns={instance}`   |
//! | pubsub    | topic + push subscription to the background endpoint    |
//! | eventarc  | `POST /emulator/v1/projects/{p}/triggers/{key}`         |
//! | auth      | multicast on `{p}:{eventType}`                          |
//! | storage   | multicast on `{p}:{eventType}:{bucket}`                 |

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::config::{Companion, CompanionEmulators};
use crate::error::{Error, Result};
use crate::trigger::{EventTrigger, TriggerDefinition, TriggerKind};

/// Owner credentials accepted by every companion emulator.
pub const OWNER_AUTHORIZATION: &str = "Bearer owner";

const FIRESTORE_SERVICE: &str = "firestore.googleapis.com";
const EVENTARC_SERVICE: &str = "eventarc.googleapis.com";
const SCHEDULE_TOPIC_PREFIX: &str = "firebase-schedule-";

static DATABASE_RESOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^projects/[^/]+/instances/([^/]+)/refs(/.*)$").expect("database resource pattern is valid")
});

/// Services that deliver events to background functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventService {
    Firestore,
    RealtimeDatabase,
    Pubsub,
    Eventarc,
    Auth,
    Storage,
}

impl EventService {
    /// Infer the service from an event type by substring, as event types
    /// from all generations embed the product name.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        if event_type.contains("firestore") {
            Some(EventService::Firestore)
        } else if event_type.contains("database") {
            Some(EventService::RealtimeDatabase)
        } else if event_type.contains("pubsub") {
            Some(EventService::Pubsub)
        } else if event_type.contains("storage") {
            Some(EventService::Storage)
        } else if event_type.contains("analytics") {
            None
        } else if event_type.contains("auth") {
            Some(EventService::Auth)
        } else {
            None
        }
    }

    pub fn from_service_name(name: &str) -> Option<Self> {
        match name {
            FIRESTORE_SERVICE => Some(EventService::Firestore),
            "firebaseio.com" | "firebasedatabase.googleapis.com" => Some(EventService::RealtimeDatabase),
            "pubsub.googleapis.com" => Some(EventService::Pubsub),
            EVENTARC_SERVICE => Some(EventService::Eventarc),
            "firebaseauth.googleapis.com" => Some(EventService::Auth),
            "storage.googleapis.com" => Some(EventService::Storage),
            _ => None,
        }
    }

    /// Service a definition's events come from, if it has one.
    pub fn for_definition(def: &TriggerDefinition) -> Option<Self> {
        match &def.kind {
            TriggerKind::EventTrigger(event) => {
                if event.channel.is_some() {
                    return Some(EventService::Eventarc);
                }
                match &event.service {
                    Some(service) => Self::from_service_name(service),
                    None => Self::from_event_type(&event.event_type),
                }
            }
            TriggerKind::ScheduleTrigger(_) => Some(EventService::Pubsub),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventService::Firestore => "firestore",
            EventService::RealtimeDatabase => "database",
            EventService::Pubsub => "pubsub",
            EventService::Eventarc => "eventarc",
            EventService::Auth => "auth",
            EventService::Storage => "storage",
        }
    }
}

impl fmt::Display for EventService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of registering a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The companion emulator accepted the trigger.
    Registered,
    /// The trigger listens on a multicast event key.
    Multicast(String),
    /// The companion emulator is not running or refused the trigger.
    Ignored,
}

/// Everything a registrar needs to register one trigger.
pub struct RegistrationContext<'a> {
    pub project_id: &'a str,
    /// Trigger key the companion should call back with
    pub key: &'a str,
    pub definition: &'a TriggerDefinition,
    pub emulators: &'a CompanionEmulators,
    pub http: &'a reqwest::Client,
    /// Base URL of this emulator's hub
    pub hub_url: &'a str,
}

impl RegistrationContext<'_> {
    /// Background invocation URL for the trigger.
    pub fn callback_url(&self) -> String {
        format!(
            "{}/functions/projects/{}/triggers/{}",
            self.hub_url, self.project_id, self.key
        )
    }
}

/// Registers background triggers with one event service.
#[async_trait]
pub trait TriggerRegistrar: Send + Sync {
    fn service(&self) -> EventService;

    async fn register(&self, ctx: &RegistrationContext<'_>, trigger: &EventTrigger) -> Result<Registration>;
}

/// Registrars keyed by service.
pub struct RegistrarTable {
    registrars: HashMap<EventService, Box<dyn TriggerRegistrar>>,
}

impl RegistrarTable {
    pub fn empty() -> Self {
        Self {
            registrars: HashMap::new(),
        }
    }

    /// Registrars for every supported service.
    pub fn standard() -> Self {
        Self::empty()
            .with(FirestoreRegistrar)
            .with(DatabaseRegistrar)
            .with(PubsubRegistrar)
            .with(EventarcRegistrar)
            .with(AuthRegistrar)
            .with(StorageRegistrar)
    }

    pub fn with<R: TriggerRegistrar + 'static>(mut self, registrar: R) -> Self {
        self.registrars.insert(registrar.service(), Box::new(registrar));
        self
    }

    pub fn get(&self, service: EventService) -> Option<&dyn TriggerRegistrar> {
        self.registrars.get(&service).map(|r| r.as_ref())
    }

    /// Register a definition with whichever service produces its events.
    pub async fn register(&self, ctx: &RegistrationContext<'_>) -> Result<Registration> {
        let Some(service) = EventService::for_definition(ctx.definition) else {
            debug!(function = %ctx.definition.id, "Unsupported trigger");
            return Ok(Registration::Ignored);
        };
        let Some(registrar) = self.get(service) else {
            debug!(function = %ctx.definition.id, %service, "No registrar for service");
            return Ok(Registration::Ignored);
        };

        let trigger = match &ctx.definition.kind {
            TriggerKind::EventTrigger(event) => event.clone(),
            TriggerKind::ScheduleTrigger(_) => EventTrigger {
                event_type: "google.pubsub.topic.publish".to_string(),
                resource: Some(format!(
                    "projects/{}/topics/{}{}",
                    ctx.project_id, SCHEDULE_TOPIC_PREFIX, ctx.definition.name
                )),
                ..Default::default()
            },
            _ => return Ok(Registration::Ignored),
        };
        registrar.register(ctx, &trigger).await
    }
}

fn with_service(trigger: &EventTrigger, service: &str) -> EventTrigger {
    let mut trigger = trigger.clone();
    trigger.service = Some(service.to_string());
    trigger
}

async fn expect_success(service: &'static str, response: reqwest::Response) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Registration {
        service,
        message: format!("{}: {}", status, body),
    })
}

pub struct FirestoreRegistrar;

#[async_trait]
impl TriggerRegistrar for FirestoreRegistrar {
    fn service(&self) -> EventService {
        EventService::Firestore
    }

    async fn register(&self, ctx: &RegistrationContext<'_>, trigger: &EventTrigger) -> Result<Registration> {
        let Some(base) = ctx.emulators.url(Companion::Firestore) else {
            return Ok(Registration::Ignored);
        };
        let bundle = serde_json::json!({ "eventTrigger": with_service(trigger, FIRESTORE_SERVICE) });
        debug!(key = ctx.key, %bundle, "Registering firestore trigger");

        let url = format!("{}/emulator/v1/projects/{}/triggers/{}", base, ctx.project_id, ctx.key);
        let response = ctx.http.put(url).json(&bundle).send().await.inspect_err(|e| {
            warn!(error = %e, "Error adding firestore function");
        })?;
        expect_success("firestore", response).await?;
        Ok(Registration::Registered)
    }
}

pub struct DatabaseRegistrar;

impl DatabaseRegistrar {
    /// `(instance, path)` from `projects/{p}/instances/{instance}/refs/{path}`.
    pub fn parse_resource(resource: &str) -> Option<(String, String)> {
        let captures = DATABASE_RESOURCE.captures(resource)?;
        Some((captures[1].to_string(), captures[2].to_string()))
    }
}

#[async_trait]
impl TriggerRegistrar for DatabaseRegistrar {
    fn service(&self) -> EventService {
        EventService::RealtimeDatabase
    }

    async fn register(&self, ctx: &RegistrationContext<'_>, trigger: &EventTrigger) -> Result<Registration> {
        let Some(base) = ctx.emulators.url(Companion::Database) else {
            return Ok(Registration::Ignored);
        };
        let resource = trigger.resource.as_deref().unwrap_or_default();
        let Some((instance, path)) = Self::parse_resource(resource) else {
            warn!(key = ctx.key, resource, "Event function has malformed resource member");
            return Err(Error::MalformedResource(format!(
                "event function {} has malformed resource member: {}",
                ctx.key, resource
            )));
        };

        let bundle = serde_json::json!({
            "name": format!("projects/{}/locations/_/functions/{}", ctx.project_id, ctx.key),
            "path": path,
            "event": trigger.event_type,
            "topic": format!("projects/{}/topics/{}", ctx.project_id, ctx.key),
        });
        debug!(key = ctx.key, instance = %instance, %bundle, "Registering database trigger");

        let response = ctx
            .http
            .post(format!("{}/.settings/functionTriggers.json", base))
            .query(&[("ns", instance.as_str())])
            .header(reqwest::header::AUTHORIZATION, OWNER_AUTHORIZATION)
            .json(&bundle)
            .send()
            .await
            .inspect_err(|e| warn!(error = %e, "Error adding Realtime Database function"))?;
        expect_success("database", response).await?;
        Ok(Registration::Registered)
    }
}

pub struct PubsubRegistrar;

impl PubsubRegistrar {
    /// Topic name: last segment of the resource, or the schedule topic.
    pub fn topic(ctx: &RegistrationContext<'_>, trigger: &EventTrigger) -> String {
        if matches!(ctx.definition.kind, TriggerKind::ScheduleTrigger(_)) {
            return format!("{}{}", SCHEDULE_TOPIC_PREFIX, ctx.definition.name);
        }
        trigger
            .resource
            .as_deref()
            .and_then(|resource| resource.rsplit('/').next())
            .unwrap_or_default()
            .to_string()
    }

    async fn try_register(&self, base: &str, ctx: &RegistrationContext<'_>, topic: &str) -> Result<()> {
        let topic_url = format!("{}/v1/projects/{}/topics/{}", base, ctx.project_id, topic);
        let response = ctx.http.put(topic_url).json(&serde_json::json!({})).send().await?;
        if response.status() != StatusCode::CONFLICT {
            expect_success("pubsub", response).await?;
        }

        let subscription: String = ctx
            .key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let subscription_url = format!(
            "{}/v1/projects/{}/subscriptions/emulator-sub-{}",
            base, ctx.project_id, subscription
        );
        let body = serde_json::json!({
            "topic": format!("projects/{}/topics/{}", ctx.project_id, topic),
            "pushConfig": { "pushEndpoint": ctx.callback_url() },
        });
        let response = ctx.http.put(subscription_url).json(&body).send().await?;
        if response.status() != StatusCode::CONFLICT {
            expect_success("pubsub", response).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TriggerRegistrar for PubsubRegistrar {
    fn service(&self) -> EventService {
        EventService::Pubsub
    }

    async fn register(&self, ctx: &RegistrationContext<'_>, trigger: &EventTrigger) -> Result<Registration> {
        let Some(base) = ctx.emulators.url(Companion::Pubsub) else {
            return Ok(Registration::Ignored);
        };
        let topic = Self::topic(ctx, trigger);
        debug!(key = ctx.key, topic = %topic, "Registering pubsub trigger");

        match self.try_register(&base, ctx, &topic).await {
            Ok(()) => Ok(Registration::Registered),
            Err(e) => {
                debug!(error = %e, "Pubsub registration failed");
                Ok(Registration::Ignored)
            }
        }
    }
}

pub struct EventarcRegistrar;

#[async_trait]
impl TriggerRegistrar for EventarcRegistrar {
    fn service(&self) -> EventService {
        EventService::Eventarc
    }

    async fn register(&self, ctx: &RegistrationContext<'_>, trigger: &EventTrigger) -> Result<Registration> {
        let Some(base) = ctx.emulators.url(Companion::Eventarc) else {
            return Ok(Registration::Ignored);
        };
        let bundle = serde_json::json!({ "eventTrigger": with_service(trigger, EVENTARC_SERVICE) });
        debug!(key = ctx.key, %bundle, "Registering eventarc trigger");

        let url = format!("{}/emulator/v1/projects/{}/triggers/{}", base, ctx.project_id, ctx.key);
        let result = match ctx.http.post(url).json(&bundle).send().await {
            Ok(response) => expect_success("eventarc", response).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => Ok(Registration::Registered),
            Err(e) => {
                warn!(error = %e, "Error adding Eventarc function");
                Ok(Registration::Ignored)
            }
        }
    }
}

pub struct AuthRegistrar;

#[async_trait]
impl TriggerRegistrar for AuthRegistrar {
    fn service(&self) -> EventService {
        EventService::Auth
    }

    async fn register(&self, ctx: &RegistrationContext<'_>, trigger: &EventTrigger) -> Result<Registration> {
        Ok(Registration::Multicast(format!("{}:{}", ctx.project_id, trigger.event_type)))
    }
}

pub struct StorageRegistrar;

impl StorageRegistrar {
    /// Bucket name from `projects/_/buckets/{bucket}` or a bare bucket.
    pub fn bucket(resource: &str) -> &str {
        match resource.strip_prefix("projects/_/buckets/") {
            Some(rest) => rest.split('/').next().unwrap_or(rest),
            None => resource,
        }
    }
}

#[async_trait]
impl TriggerRegistrar for StorageRegistrar {
    fn service(&self) -> EventService {
        EventService::Storage
    }

    async fn register(&self, ctx: &RegistrationContext<'_>, trigger: &EventTrigger) -> Result<Registration> {
        let bucket = Self::bucket(trigger.resource.as_deref().unwrap_or_default());
        Ok(Registration::Multicast(format!(
            "{}:{}:{}",
            ctx.project_id, trigger.event_type, bucket
        )))
    }
}
