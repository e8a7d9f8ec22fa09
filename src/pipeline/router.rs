//! Message router: one state machine run per inbound message.
//!
//! ```text
//! RECEIVED -> DEDUP_CHECK -> DROPPED (duplicate / echo)
//!                         -> CLASSIFY -> OPERATOR: INTERPRET -> DISPATCH_ACTION -> NOTIFY
//!                                     -> PUBLIC:   RESOLVE_CONTACT -> POLICY -> RULES
//!                                                  -> DECIDE -> GENERATE -> DISPATCH_REPLY -> NOTIFY
//! ```
//!
//! Every run ends in a [`RouteOutcome`]. Nothing survives between runs
//! except what the shared services persist.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::admin::{AdminSessions, parse_admin_utterance};
use crate::agent::approval::{Confirmation, DestructiveAction, DestructiveGate};
use crate::channels::mail_sync::MailApi;
use crate::channels::operator::{Notice, OperatorNotifier};
use crate::channels::transport::{Dispatcher, Outbound};
use crate::config::RelayConfig;
use crate::contacts::normalize::{normalize_address, normalize_phone};
use crate::contacts::{Contact, ContactDirectory, Lookup, ReplyPolicy};
use crate::error::{ChannelError, PipelineError};
use crate::llm::keywords::keyword_intent;
use crate::llm::{CommandAction, CommandIntent, Inference};
use crate::pipeline::channel_gate::{ChannelGate, Toggle, ToggleTarget, parse_toggle_utterance};
use crate::pipeline::dedup::Deduplicator;
use crate::pipeline::rules::{RuleAction, RuleEvaluator, RuleFields, RuleScope, parse_rule_spec};
use crate::pipeline::types::{Channel, DropReason, Message, RouteOutcome};

/// Used when no inference timeout is configured.
const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(20);

const REPLY_MAX_TOKENS: u32 = 200;
const REPLY_TEMPERATURE: f32 = 0.6;

/// Longest inbound excerpt put in a summary notice.
const SUMMARY_CHARS: usize = 280;

const HELP_TEXT: &str = "Commands:
- turn on/off texts | voicemail | email | everything
- never / always / auto reply to <who>, ask me about <who>
- add rule <direct|mail> <condition> <value> -> <action>
- list rules, clear rules
- find <who>
- text <who>: <message>
- trash all mail from <address>
- status";

/// Anything that accepts inbound messages for routing.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, msg: Message);
}

/// Services the router orchestrates. Built once at startup.
pub struct RouterServices {
    pub dedup: Deduplicator,
    pub gate: Arc<ChannelGate>,
    pub contacts: Arc<ContactDirectory>,
    pub rules: Arc<RuleEvaluator>,
    pub admin: Arc<AdminSessions>,
    pub destructive: Arc<DestructiveGate>,
    pub dispatcher: Dispatcher,
    pub notifier: Arc<dyn OperatorNotifier>,
    pub inference: Option<Arc<dyn Inference>>,
    /// Needed for mail-side destructive actions.
    pub mail: Option<Arc<dyn MailApi>>,
}

#[derive(Debug, Clone)]
struct RouterSettings {
    operator_ids: Vec<String>,
    owner_name: String,
    fallback_reply: String,
    inference_timeout: Duration,
}

/// What the public path decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Reply,
    /// Draft a reply but hand it to the operator.
    Review,
    Notify,
    Silent,
}

/// Cheap to clone; every field is a shared handle.
#[derive(Clone)]
pub struct MessageRouter {
    dedup: Deduplicator,
    gate: Arc<ChannelGate>,
    contacts: Arc<ContactDirectory>,
    rules: Arc<RuleEvaluator>,
    admin: Arc<AdminSessions>,
    destructive: Arc<DestructiveGate>,
    dispatcher: Arc<Dispatcher>,
    notifier: Arc<dyn OperatorNotifier>,
    inference: Option<Arc<dyn Inference>>,
    mail: Option<Arc<dyn MailApi>>,
    settings: Arc<RouterSettings>,
}

impl MessageRouter {
    pub fn new(services: RouterServices, config: &RelayConfig) -> Self {
        let settings = RouterSettings {
            operator_ids: config.operator_ids.clone(),
            owner_name: config.owner_name.clone(),
            fallback_reply: config.fallback_reply.clone(),
            inference_timeout: config
                .inference
                .as_ref()
                .map(|i| i.timeout)
                .unwrap_or(DEFAULT_INFERENCE_TIMEOUT),
        };
        Self {
            dedup: services.dedup,
            gate: services.gate,
            contacts: services.contacts,
            rules: services.rules,
            admin: services.admin,
            destructive: services.destructive,
            dispatcher: Arc::new(services.dispatcher),
            notifier: services.notifier,
            inference: services.inference,
            mail: services.mail,
            settings: Arc::new(settings),
        }
    }

    /// Override the caller-side ceiling on inference calls.
    pub fn with_inference_timeout(mut self, timeout: Duration) -> Self {
        Arc::make_mut(&mut self.settings).inference_timeout = timeout;
        self
    }

    /// Route `msg` on its own supervised task.
    ///
    /// A failure or panic inside the run becomes an operator error notice and
    /// resolves to `None`; it never reaches the caller or sibling tasks.
    pub fn submit(&self, msg: Message) -> JoinHandle<Option<RouteOutcome>> {
        let router = self.clone();
        tokio::spawn(async move {
            let id = msg.id.clone();
            let channel = msg.channel;
            let worker = {
                let router = router.clone();
                tokio::spawn(async move { router.handle(msg).await })
            };

            let message = match worker.await {
                Ok(Ok(outcome)) => return Some(outcome),
                Ok(Err(e)) => {
                    error!(id = %id, channel = %channel, error = %e, "Message processing failed");
                    format!("Failed to process {channel} message: {e}")
                }
                Err(join) if join.is_panic() => {
                    error!(id = %id, channel = %channel, "Message task panicked");
                    format!("Internal fault while processing a {channel} message")
                }
                Err(join) => {
                    warn!(id = %id, error = %join, "Message task cancelled");
                    return None;
                }
            };
            router.notifier.notify(Notice::Error { message }).await;
            None
        })
    }

    /// Run the state machine for one message.
    pub async fn handle(&self, msg: Message) -> Result<RouteOutcome, PipelineError> {
        debug!(id = %msg.id, channel = %msg.channel, sender = %msg.sender, "Received");

        if msg.body.trim().is_empty() {
            return Ok(self.dropped(&msg, DropReason::EmptyBody));
        }

        // The console is a single source and repeats commands on purpose.
        if msg.channel != Channel::Operator {
            if self.dedup.was_sent_recently(&msg.body).await? {
                return Ok(self.dropped(&msg, DropReason::Echo));
            }
            if !self
                .dedup
                .is_new(&msg.sender, &msg.body, msg.timestamp_ms())
                .await?
            {
                return Ok(self.dropped(&msg, DropReason::Duplicate));
            }

            if let Some(code) = parse_admin_utterance(&msg.body) {
                return self.authenticate(&msg, code).await;
            }
        }

        if self.is_operator(&msg).await {
            info!(id = %msg.id, channel = %msg.channel, "Classified as operator");
            return self.operator_path(&msg).await;
        }
        self.public_path(&msg).await
    }

    fn dropped(&self, msg: &Message, reason: DropReason) -> RouteOutcome {
        debug!(id = %msg.id, reason = ?reason, "Dropped");
        RouteOutcome::dropped(reason)
    }

    async fn is_operator(&self, msg: &Message) -> bool {
        msg.channel == Channel::Operator
            || self.settings.operator_ids.contains(&msg.sender)
            || self.admin.is_active(&msg.sender).await
    }

    /// `admin <code>`: never answered on the public channel.
    async fn authenticate(&self, msg: &Message, code: &str) -> Result<RouteOutcome, PipelineError> {
        match self.admin.authenticate(&msg.sender, code).await? {
            Some(session) => {
                let response = format!(
                    "Admin session granted to {} until {}",
                    session.identity,
                    session.expires_at(self.admin.window()).format("%H:%M UTC")
                );
                self.notifier
                    .notify(Notice::CommandResult {
                        text: response.clone(),
                    })
                    .await;
                Ok(RouteOutcome::OperatorHandled { response })
            }
            None => {
                self.notifier
                    .notify(Notice::Error {
                        message: format!(
                            "Rejected admin login from {} on {}",
                            msg.sender, msg.channel
                        ),
                    })
                    .await;
                Ok(RouteOutcome::Silent)
            }
        }
    }

    // ── Operator path ───────────────────────────────────────────────

    async fn operator_path(&self, msg: &Message) -> Result<RouteOutcome, PipelineError> {
        let response = match self.destructive.confirm(&msg.body).await {
            Confirmation::Executed(pending) => self.execute(pending.action).await,
            Confirmation::Cancelled(pending) => format!("Cancelled: {}", pending.action),
            Confirmation::NothingPending => {
                let intent = self.interpret(&msg.body).await;
                info!(
                    id = %msg.id,
                    action = ?intent.action,
                    destructive = intent.action.is_destructive(),
                    "Operator command"
                );
                self.run_command(msg, intent).await?
            }
        };

        self.notifier
            .notify(Notice::CommandResult {
                text: response.clone(),
            })
            .await;

        // A remote operator reads the answer where they asked.
        if msg.channel != Channel::Operator {
            self.dedup.mark_sent(&response).await?;
            if let Err(e) = self
                .dispatcher
                .dispatch(msg.channel, &Outbound::reply_to(msg, response.clone()))
                .await
            {
                warn!(id = %msg.id, error = %e, "Could not return command result to remote operator");
            }
        }

        Ok(RouteOutcome::OperatorHandled { response })
    }

    /// Structured intent from inference, or the keyword matcher when
    /// inference is missing, failing, slow or unsure.
    async fn interpret(&self, text: &str) -> CommandIntent {
        let Some(inference) = &self.inference else {
            return keyword_intent(text);
        };
        match tokio::time::timeout(
            self.settings.inference_timeout,
            inference.interpret_command(text),
        )
        .await
        {
            Ok(Ok(intent)) if intent.action != CommandAction::Unknown => intent,
            Ok(Ok(_)) => keyword_intent(text),
            Ok(Err(e)) => {
                warn!(provider = inference.name(), error = %e, "Command interpretation failed; using keywords");
                keyword_intent(text)
            }
            Err(_) => {
                warn!(provider = inference.name(), "Command interpretation timed out; using keywords");
                keyword_intent(text)
            }
        }
    }

    async fn run_command(&self, msg: &Message, intent: CommandIntent) -> Result<String, PipelineError> {
        let target = intent.target.as_deref().map(str::trim).unwrap_or_default();
        let content = intent.content.as_deref().map(str::trim).unwrap_or_default();

        let response = match intent.action {
            CommandAction::ToggleChannel => {
                let Some(toggle) = toggle_from_intent(target, content)
                    .or_else(|| parse_toggle_utterance(&msg.body))
                else {
                    return Ok("Which channel, and on or off?".into());
                };
                let changed = self.gate.apply(toggle).await?;
                let names: Vec<&str> = changed.iter().map(Channel::as_str).collect();
                format!(
                    "{} {}",
                    names.join(", "),
                    if toggle.enable { "enabled" } else { "disabled" }
                )
            }

            CommandAction::SetPolicy => {
                if target.is_empty() {
                    return Ok("Whose policy?".into());
                }
                let (instruction, policy) = match content.parse::<ReplyPolicy>() {
                    Ok(policy) => (None, Some(policy)),
                    Err(_) if content.is_empty() => return Ok("Which policy?".into()),
                    Err(_) => (Some(content.to_string()), None),
                };
                // A raw number, short code or address gets a contact on the spot.
                let short_code = target.chars().all(|c| c.is_ascii_digit());
                if short_code
                    || normalize_phone(target).is_some()
                    || normalize_address(target).is_some()
                {
                    self.contacts.find_or_create(target).await?;
                }
                match self.contacts.set_policy(target, instruction, policy).await? {
                    Lookup::Found(c) => match c.instruction.as_deref().filter(|_| policy.is_none()) {
                        Some(i) => format!("Noted for {}: {i}", c.label()),
                        None => format!("{} is now {}", c.label(), c.policy),
                    },
                    Lookup::NotFound => format!("No contact matches '{target}'"),
                    Lookup::Ambiguous(list) => ambiguous_text(target, &list),
                }
            }

            CommandAction::AddRule => {
                let scope = match target.parse::<RuleScope>() {
                    Ok(scope) => scope,
                    Err(e) => return Ok(format!("Rule scope must be direct or mail ({e})")),
                };
                match parse_rule_spec(scope, content) {
                    Ok(rule) => format!("Added rule {}", self.rules.add(rule).await?.describe()),
                    Err(e) => format!("Could not add rule: {e}"),
                }
            }

            CommandAction::ListRules => {
                let rules = self.rules.rules(None).await;
                if rules.is_empty() {
                    "No rules.".into()
                } else {
                    rules
                        .iter()
                        .enumerate()
                        .map(|(i, r)| format!("{}. {}", i + 1, r.describe()))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }

            CommandAction::FindContact => match self.contacts.lookup(target).await {
                Lookup::Found(c) => describe_contact(&c),
                Lookup::NotFound => format!("No contact matches '{target}'"),
                Lookup::Ambiguous(list) => ambiguous_text(target, &list),
            },

            CommandAction::SendMessage => {
                if target.is_empty() || content.is_empty() {
                    return Ok("Send what to whom?".into());
                }
                match self.resolve_recipient(target).await {
                    Ok((channel, to)) => self.send_on_behalf(channel, &to, content).await?,
                    Err(reason) => reason,
                }
            }

            CommandAction::TrashMail => {
                if self.mail.is_none() {
                    return Ok("Mail is not configured.".into());
                }
                let Some(sender) = normalize_address(target) else {
                    return Ok(format!("'{target}' is not a mail address"));
                };
                self.propose(DestructiveAction::TrashMailFrom { sender }).await
            }

            CommandAction::ClearRules => self.propose(DestructiveAction::ClearRules).await,

            CommandAction::Status => self.status_text().await,

            CommandAction::Help => HELP_TEXT.into(),

            CommandAction::Unknown => "I didn't understand that. Say 'help' for commands.".into(),
        };
        Ok(response)
    }

    async fn propose(&self, action: DestructiveAction) -> String {
        let description = action.to_string();
        let token = self.destructive.propose(action).await;
        self.notifier
            .notify(Notice::ConfirmRequired {
                token: token.to_string(),
                action: description.clone(),
            })
            .await;
        format!("Reply with the admin code to {description}. Anything else cancels.")
    }

    /// Run a confirmed destructive action. Failures become the response text.
    async fn execute(&self, action: DestructiveAction) -> String {
        match action {
            DestructiveAction::TrashMailFrom { sender } => {
                let Some(mail) = &self.mail else {
                    return "Mail is not configured.".into();
                };
                match mail.trash_from(&sender).await {
                    Ok(n) => format!("Moved {n} messages from {sender} to trash"),
                    Err(e) => {
                        error!(sender = %sender, error = %e, "Trash failed");
                        if e.is_credential() {
                            self.notifier
                                .notify(Notice::Credential {
                                    message: format!("Mail credential problem: {e}"),
                                })
                                .await;
                        }
                        format!("Trash failed: {e}")
                    }
                }
            }
            DestructiveAction::ClearRules => match self.rules.clear().await {
                Ok(n) => format!("Deleted {n} rules"),
                Err(e) => {
                    error!(error = %e, "Clearing rules failed");
                    format!("Clearing rules failed: {e}")
                }
            },
        }
    }

    async fn resolve_recipient(&self, who: &str) -> Result<(Channel, String), String> {
        if let Some(phone) = normalize_phone(who) {
            return Ok((Channel::Direct, phone));
        }
        if let Some(address) = normalize_address(who) {
            return Ok((Channel::Mail, address));
        }
        match self.contacts.lookup(who).await {
            Lookup::Found(c) => c
                .phones
                .iter()
                .next()
                .map(|p| (Channel::Direct, p.clone()))
                .or_else(|| c.addresses.iter().next().map(|a| (Channel::Mail, a.clone())))
                .ok_or_else(|| format!("{} has no number or address on file", c.label())),
            Lookup::NotFound => Err(format!("No contact matches '{who}'")),
            Lookup::Ambiguous(list) => Err(ambiguous_text(who, &list)),
        }
    }

    async fn send_on_behalf(&self, channel: Channel, to: &str, body: &str) -> Result<String, PipelineError> {
        self.dedup.mark_sent(body).await?;
        Ok(
            match self.dispatcher.dispatch(channel, &Outbound::new(to, body)).await {
                Ok(()) => format!("Sent to {to}"),
                Err(e) => format!("Could not send to {to}: {e}"),
            },
        )
    }

    async fn status_text(&self) -> String {
        let channels: Vec<String> = self
            .gate
            .snapshot()
            .await
            .into_iter()
            .map(|(ch, on)| format!("{ch} {}", if on { "on" } else { "off" }))
            .collect();
        format!(
            "Channels: {}\nRules: {}\nContacts: {}\nAdmin sessions: {}\nPending confirmation: {}",
            channels.join(", "),
            self.rules.rules(None).await.len(),
            self.contacts.len().await,
            self.admin.active_identities().await.len(),
            if self.destructive.has_pending().await { "yes" } else { "no" },
        )
    }

    // ── Public path ─────────────────────────────────────────────────

    async fn public_path(&self, msg: &Message) -> Result<RouteOutcome, PipelineError> {
        if !self.gate.is_enabled(msg.channel).await {
            return Ok(self.dropped(msg, DropReason::ChannelDisabled));
        }

        let contact = self.contacts.find_or_create(&msg.sender).await?;
        if contact.policy == ReplyPolicy::Never {
            info!(id = %msg.id, contact = %contact.label(), "Policy NEVER; dropping");
            return Ok(self.dropped(msg, DropReason::PolicyNever));
        }

        let rule_action = match RuleScope::for_channel(msg.channel) {
            Some(scope) => {
                let (action, rule) = self.rules.evaluate(scope, &RuleFields::from_message(msg)).await;
                if let Some(rule) = rule {
                    debug!(id = %msg.id, rule = %rule.id, action = %action, "Rule decided");
                }
                action
            }
            None => RuleAction::DeferToContactPolicy,
        };

        let decision = decide(msg.channel, contact.policy, rule_action);
        info!(
            id = %msg.id,
            channel = %msg.channel,
            policy = %contact.policy,
            decision = ?decision,
            "Decided"
        );

        let from = contact
            .name
            .clone()
            .unwrap_or_else(|| msg.display_sender().to_string());

        match decision {
            Decision::Silent => Ok(RouteOutcome::Silent),
            Decision::Notify => {
                self.notifier
                    .notify(Notice::Summary {
                        channel: msg.channel,
                        from,
                        text: excerpt(&msg.body),
                    })
                    .await;
                Ok(RouteOutcome::Notified)
            }
            Decision::Review => {
                let draft = self.generate_reply(msg, &contact).await;
                self.notifier
                    .notify(Notice::NeedsReview {
                        channel: msg.channel,
                        from,
                        body: msg.body.clone(),
                        draft: Some(draft),
                        reason: "manual review".into(),
                    })
                    .await;
                Ok(RouteOutcome::Notified)
            }
            Decision::Reply => {
                let body = self.generate_reply(msg, &contact).await;
                self.dispatch_reply(msg, from, body).await
            }
        }
    }

    async fn dispatch_reply(&self, msg: &Message, from: String, body: String) -> Result<RouteOutcome, PipelineError> {
        // Recorded before sending: the transport may echo it back before send returns.
        self.dedup.mark_sent(&body).await?;

        match self
            .dispatcher
            .dispatch(msg.channel, &Outbound::reply_to(msg, body.clone()))
            .await
        {
            Ok(()) => {
                self.notifier
                    .notify(Notice::Summary {
                        channel: msg.channel,
                        from,
                        text: excerpt(&msg.body),
                    })
                    .await;
                self.notifier
                    .notify(Notice::ReplySent {
                        channel: msg.channel,
                        to: msg.sender.clone(),
                        body: body.clone(),
                    })
                    .await;
                Ok(RouteOutcome::Replied { body })
            }
            Err(e) => {
                let reason = match &e {
                    ChannelError::Unreachable { .. } => "recipient unreachable".to_string(),
                    other => format!("send failed: {other}"),
                };
                warn!(id = %msg.id, channel = %msg.channel, error = %e, "Reply not delivered; handing to operator");
                self.notifier
                    .notify(Notice::NeedsReview {
                        channel: msg.channel,
                        from,
                        body: msg.body.clone(),
                        draft: Some(body.clone()),
                        reason,
                    })
                    .await;
                Ok(RouteOutcome::ReplyUndeliverable { body })
            }
        }
    }

    /// Generated reply, or the canned fallback when generation fails,
    /// times out or comes back empty.
    async fn generate_reply(&self, msg: &Message, contact: &Contact) -> String {
        let Some(inference) = &self.inference else {
            return self.settings.fallback_reply.clone();
        };
        let prompt = self.reply_prompt(msg, contact);
        let result = tokio::time::timeout(
            self.settings.inference_timeout,
            inference.generate(&prompt, REPLY_MAX_TOKENS, REPLY_TEMPERATURE),
        )
        .await;

        let text = match result {
            Ok(Ok(text)) => clean_reply(&text),
            Ok(Err(e)) => {
                warn!(id = %msg.id, provider = inference.name(), error = %e, "Reply generation failed");
                String::new()
            }
            Err(_) => {
                warn!(id = %msg.id, provider = inference.name(), "Reply generation timed out");
                String::new()
            }
        };
        if text.is_empty() {
            self.settings.fallback_reply.clone()
        } else {
            text
        }
    }

    fn reply_prompt(&self, msg: &Message, contact: &Contact) -> String {
        let mut prompt = format!(
            "You are replying on behalf of {owner}, who is unavailable. Write a short, \
             friendly reply in their voice. Do not make commitments or share private details.\n\n",
            owner = self.settings.owner_name
        );
        prompt.push_str(&format!("Channel: {}\n", msg.channel));
        prompt.push_str(&format!("From: {}\n", msg.display_sender()));
        if let Some(relationship) = &contact.relationship {
            prompt.push_str(&format!("Relationship: {relationship}\n"));
        }
        if let Some(instruction) = &contact.instruction {
            prompt.push_str(&format!("Guidance for this person: {instruction}\n"));
        }
        if let Some(subject) = &msg.subject {
            prompt.push_str(&format!("Subject: {subject}\n"));
        }
        prompt.push_str(&format!("\nMessage:\n{}\n\nReply text only:", msg.body));
        prompt
    }
}

impl MessageSink for MessageRouter {
    fn deliver(&self, msg: Message) {
        // Supervision lives inside the task; the handle is not needed.
        drop(self.submit(msg));
    }
}

fn decide(channel: Channel, policy: ReplyPolicy, action: RuleAction) -> Decision {
    match policy {
        ReplyPolicy::Always => Decision::Reply,
        ReplyPolicy::ManualReview => Decision::Review,
        ReplyPolicy::Never => Decision::Silent,
        ReplyPolicy::Automatic => match action {
            RuleAction::AutoReply => Decision::Reply,
            RuleAction::SilentDiscard => Decision::Silent,
            RuleAction::NotifyOnly => Decision::Notify,
            RuleAction::DeferToContactPolicy => match channel {
                Channel::Direct | Channel::ForwardedVoice => Decision::Reply,
                Channel::Mail | Channel::Operator => Decision::Notify,
            },
        },
    }
}

fn toggle_from_intent(target: &str, content: &str) -> Option<Toggle> {
    let enable = match content.to_lowercase().as_str() {
        "on" | "enable" | "enabled" | "true" | "resume" => true,
        "off" | "disable" | "disabled" | "false" | "pause" => false,
        _ => return None,
    };
    let target = match target.to_lowercase().as_str() {
        "all" | "everything" => ToggleTarget::All,
        other => ToggleTarget::One(other.parse::<Channel>().ok()?),
    };
    if target == ToggleTarget::One(Channel::Operator) {
        return None;
    }
    Some(Toggle { target, enable })
}

/// Strip quoting and labels models like to add around a reply.
fn clean_reply(text: &str) -> String {
    let text = text.trim();
    let text = text
        .strip_prefix("Reply:")
        .or_else(|| text.strip_prefix("reply:"))
        .unwrap_or(text)
        .trim();
    text.trim_matches('"').trim().to_string()
}

fn excerpt(body: &str) -> String {
    if body.chars().count() <= SUMMARY_CHARS {
        return body.to_string();
    }
    let mut out: String = body.chars().take(SUMMARY_CHARS).collect();
    out.push_str("...");
    out
}

fn describe_contact(c: &Contact) -> String {
    let mut lines = vec![c.label()];
    if !c.phones.is_empty() {
        lines.push(format!("phones: {}", c.phones.iter().cloned().collect::<Vec<_>>().join(", ")));
    }
    if !c.addresses.is_empty() {
        lines.push(format!(
            "addresses: {}",
            c.addresses.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if let Some(r) = &c.relationship {
        lines.push(format!("relationship: {r}"));
    }
    lines.push(format!("policy: {}", c.policy));
    if let Some(i) = &c.instruction {
        lines.push(format!("instruction: {i}"));
    }
    lines.join("\n")
}

fn ambiguous_text(query: &str, list: &[Contact]) -> String {
    let names: Vec<String> = list.iter().map(Contact::label).collect();
    format!("'{query}' matches several contacts: {}. Be more specific.", names.join(", "))
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::agent::approval::DEFAULT_PENDING_EXPIRY;
    use crate::channels::mail_sync::scripted::ScriptedMailApi;
    use crate::channels::operator::recording::RecordingNotifier;
    use crate::channels::transport::recording::{Behavior, RecordingTransport};
    use crate::llm::stub::{Script, StubInference};
    use crate::pipeline::rules::{ConditionType, Rule};
    use crate::store::{LibSqlBackend, RecordStore};

    const CODE: &str = "tulip42";
    const ALICE: &str = "+15551234567";

    struct Harness {
        router: MessageRouter,
        transport: Arc<RecordingTransport>,
        notifier: Arc<RecordingNotifier>,
        mail: Arc<ScriptedMailApi>,
        contacts: Arc<ContactDirectory>,
        rules: Arc<RuleEvaluator>,
        gate: Arc<ChannelGate>,
    }

    async fn harness(inference: Option<StubInference>, behavior: Behavior) -> Harness {
        let store: Arc<dyn RecordStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (dedup, _) = Deduplicator::spawn(Duration::from_secs(300), 100);
        let gate = Arc::new(ChannelGate::load(Arc::clone(&store)).await.unwrap());
        let contacts = Arc::new(ContactDirectory::load(Arc::clone(&store)).await.unwrap());
        let rules = Arc::new(RuleEvaluator::load(Arc::clone(&store)).await.unwrap());
        let admin = Arc::new(
            AdminSessions::load(
                Arc::clone(&store),
                SecretString::from(CODE),
                Duration::from_secs(1800),
            )
            .await
            .unwrap(),
        );
        let destructive = Arc::new(DestructiveGate::new(
            SecretString::from(CODE),
            DEFAULT_PENDING_EXPIRY,
        ));
        let transport = Arc::new(RecordingTransport::new(behavior));
        let dispatcher = Dispatcher::new()
            .with(Channel::Direct, transport.clone())
            .with(Channel::ForwardedVoice, transport.clone())
            .with(Channel::Mail, transport.clone());
        let notifier = Arc::new(RecordingNotifier::default());
        let mail = Arc::new(ScriptedMailApi::default());

        let mut config = RelayConfig::default();
        config.operator_ids = vec!["+15550000000".into()];
        config.fallback_reply = "Away right now.".into();

        let router = MessageRouter::new(
            RouterServices {
                dedup,
                gate: Arc::clone(&gate),
                contacts: Arc::clone(&contacts),
                rules: Arc::clone(&rules),
                admin,
                destructive,
                dispatcher,
                notifier: notifier.clone(),
                inference: inference.map(|i| Arc::new(i) as Arc<dyn Inference>),
                mail: Some(mail.clone()),
            },
            &config,
        )
        .with_inference_timeout(Duration::from_millis(100));

        Harness {
            router,
            transport,
            notifier,
            mail,
            contacts,
            rules,
            gate,
        }
    }

    fn text(sender: &str, body: &str) -> Message {
        Message::new(Channel::Direct, sender, body)
    }

    fn console(body: &str) -> Message {
        Message::new(Channel::Operator, "operator", body)
    }

    #[tokio::test]
    async fn double_delivery_acts_once() {
        let h = harness(Some(StubInference::replying("Hi! Back soon.")), Behavior::Deliver).await;
        let direct = text(ALICE, "are you free tonight?").at_millis(1_000);
        // Same event seen by the notification listener with a skewed clock.
        let notification = text("(555) 123-4567", "are you free tonight?").at_millis(1_450);

        let (a, b) = tokio::join!(h.router.submit(direct), h.router.submit(notification));
        let outcomes = [a.unwrap().unwrap(), b.unwrap().unwrap()];

        let replied = outcomes
            .iter()
            .filter(|o| matches!(o, RouteOutcome::Replied { .. }))
            .count();
        let dupes = outcomes
            .iter()
            .filter(|o| **o == RouteOutcome::dropped(DropReason::Duplicate))
            .count();
        assert_eq!((replied, dupes), (1, 1));
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn own_reply_echo_is_dropped() {
        let h = harness(Some(StubInference::replying("Hi! Back soon.")), Behavior::Deliver).await;
        h.router.handle(text(ALICE, "hello")).await.unwrap();

        let echo = h.router.handle(text(ALICE, "Hi! Back soon.")).await.unwrap();
        assert_eq!(echo, RouteOutcome::dropped(DropReason::Echo));
    }

    #[tokio::test]
    async fn disabled_channel_drops() {
        let h = harness(None, Behavior::Deliver).await;
        h.gate.set_enabled(Channel::Direct, false).await.unwrap();
        let outcome = h.router.handle(text(ALICE, "hello")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::dropped(DropReason::ChannelDisabled));
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn never_policy_drops_without_notice() {
        let h = harness(None, Behavior::Deliver).await;
        h.contacts.find_or_create(ALICE).await.unwrap();
        h.contacts
            .set_policy(ALICE, None, Some(ReplyPolicy::Never))
            .await
            .unwrap();

        let outcome = h.router.handle(text(ALICE, "hello")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::dropped(DropReason::PolicyNever));
        assert!(h.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn short_code_can_be_silenced_from_console() {
        let h = harness(None, Behavior::Deliver).await;
        h.router.handle(text("72345", "Your code is 1234")).await.unwrap();
        h.router
            .handle(console("never reply to 72345"))
            .await
            .unwrap();

        let outcome = h
            .router
            .handle(text("72345", "Your code is 9876"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::dropped(DropReason::PolicyNever));
        assert_eq!(h.contacts.len().await, 1);
    }

    #[tokio::test]
    async fn rules_decide_for_automatic_contacts() {
        let h = harness(None, Behavior::Deliver).await;
        h.rules
            .add(
                Rule::new(
                    RuleScope::Direct,
                    ConditionType::BodyContains,
                    "unsubscribe",
                    RuleAction::SilentDiscard,
                )
                .unwrap(),
            )
            .await
            .unwrap();

        let outcome = h
            .router
            .handle(text(ALICE, "reply STOP to unsubscribe"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Silent);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn always_policy_overrides_silent_rule() {
        let h = harness(None, Behavior::Deliver).await;
        h.rules
            .add(
                Rule::new(
                    RuleScope::Direct,
                    ConditionType::BodyContains,
                    "hello",
                    RuleAction::SilentDiscard,
                )
                .unwrap(),
            )
            .await
            .unwrap();
        h.contacts.find_or_create(ALICE).await.unwrap();
        h.contacts
            .set_policy(ALICE, None, Some(ReplyPolicy::Always))
            .await
            .unwrap();

        let outcome = h.router.handle(text(ALICE, "hello")).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Replied { .. }));
    }

    #[tokio::test]
    async fn mail_defaults_to_notify_only() {
        let h = harness(None, Behavior::Deliver).await;
        let msg = Message::new(Channel::Mail, "bob@example.com", "quarterly numbers attached")
            .with_subject("Q3");
        assert_eq!(h.router.handle(msg).await.unwrap(), RouteOutcome::Notified);
        assert!(matches!(
            h.notifier.notices().as_slice(),
            [Notice::Summary { channel: Channel::Mail, .. }]
        ));
    }

    #[tokio::test]
    async fn manual_review_sends_draft_to_operator() {
        let h = harness(Some(StubInference::replying("Draft text")), Behavior::Deliver).await;
        h.contacts.find_or_create(ALICE).await.unwrap();
        h.contacts
            .set_policy(ALICE, None, Some(ReplyPolicy::ManualReview))
            .await
            .unwrap();

        assert_eq!(
            h.router.handle(text(ALICE, "hello")).await.unwrap(),
            RouteOutcome::Notified
        );
        assert!(h.transport.sent().is_empty());
        assert!(matches!(
            h.notifier.notices().as_slice(),
            [Notice::NeedsReview { draft: Some(d), .. }] if d == "Draft text"
        ));
    }

    #[tokio::test]
    async fn unreachable_recipient_falls_back_to_operator() {
        let h = harness(Some(StubInference::replying("On my way")), Behavior::Unreachable).await;
        let outcome = h.router.handle(text(ALICE, "where are you")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::ReplyUndeliverable {
                body: "On my way".into()
            }
        );
        assert!(h.notifier.notices().iter().any(|n| matches!(
            n,
            Notice::NeedsReview { reason, draft: Some(_), .. } if reason == "recipient unreachable"
        )));
    }

    #[tokio::test]
    async fn slow_inference_falls_back_to_template() {
        let h = harness(Some(StubInference::new(vec![Script::Hang])), Behavior::Deliver).await;
        let outcome = h.router.handle(text(ALICE, "hello")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Replied {
                body: "Away right now.".into()
            }
        );
    }

    #[tokio::test]
    async fn empty_generation_falls_back_to_template() {
        let h = harness(Some(StubInference::replying("  \"\" ")), Behavior::Deliver).await;
        let outcome = h.router.handle(text(ALICE, "hello")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Replied {
                body: "Away right now.".into()
            }
        );
    }

    #[tokio::test]
    async fn panicking_task_becomes_error_notice() {
        let h = harness(None, Behavior::Panic).await;
        let result = h.router.submit(text(ALICE, "hello")).await.unwrap();
        assert!(result.is_none());
        assert!(
            h.notifier
                .notices()
                .iter()
                .any(|n| matches!(n, Notice::Error { .. }))
        );
    }

    #[tokio::test]
    async fn operator_toggle_uses_keywords_when_inference_fails() {
        let h = harness(Some(StubInference::new(vec![Script::Fail])), Behavior::Deliver).await;
        let outcome = h.router.handle(console("turn off email")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::OperatorHandled {
                response: "mail disabled".into()
            }
        );
        assert!(!h.gate.is_enabled(Channel::Mail).await);
    }

    #[tokio::test]
    async fn operator_commands_are_not_deduplicated() {
        let h = harness(None, Behavior::Deliver).await;
        let first = h.router.handle(console("status")).await.unwrap();
        let second = h.router.handle(console("status")).await.unwrap();
        assert!(matches!(first, RouteOutcome::OperatorHandled { .. }));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn configured_operator_bypasses_rules() {
        let h = harness(None, Behavior::Deliver).await;
        let outcome = h
            .router
            .handle(text("+15550000000", "never reply to +15559998888"))
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::OperatorHandled { .. }));
        let Lookup::Found(c) = h.contacts.lookup("+15559998888").await else {
            panic!("contact not created");
        };
        assert_eq!(c.policy, ReplyPolicy::Never);
        // The answer goes back to the remote operator.
        assert_eq!(h.transport.sent()[0].target, "+15550000000");
    }

    #[tokio::test]
    async fn trash_requires_code_and_runs_once() {
        let h = harness(None, Behavior::Deliver).await;
        let outcome = h
            .router
            .handle(console("trash all mail from Spam@Shop.example"))
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::OperatorHandled { .. }));
        assert!(
            h.notifier
                .notices()
                .iter()
                .any(|n| matches!(n, Notice::ConfirmRequired { .. }))
        );

        let outcome = h.router.handle(console("ok tulip42")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::OperatorHandled {
                response: "Moved 1 messages from spam@shop.example to trash".into()
            }
        );

        // Nothing pending any more: the code is just an unknown command now.
        h.router.handle(console("tulip42")).await.unwrap();
        assert_eq!(
            h.mail.trashed.lock().unwrap().as_slice(),
            ["spam@shop.example".to_string()]
        );
    }

    #[tokio::test]
    async fn other_reply_cancels_pending_action() {
        let h = harness(None, Behavior::Deliver).await;
        h.router
            .handle(console("trash all mail from x@y.com"))
            .await
            .unwrap();
        let outcome = h.router.handle(console("maybe later")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::OperatorHandled {
                response: "Cancelled: trash all mail from x@y.com".into()
            }
        );
        h.router.handle(console("tulip42")).await.unwrap();
        assert!(h.mail.trashed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_admin_login_grants_operator_access() {
        let h = harness(None, Behavior::Deliver).await;
        let login = h.router.handle(text(ALICE, "admin tulip42")).await.unwrap();
        assert!(matches!(login, RouteOutcome::OperatorHandled { .. }));
        // Login itself is not answered publicly.
        assert!(h.transport.sent().is_empty());

        let outcome = h.router.handle(text(ALICE, "list rules")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::OperatorHandled {
                response: "No rules.".into()
            }
        );
    }

    #[tokio::test]
    async fn failed_admin_login_is_silent() {
        let h = harness(None, Behavior::Deliver).await;
        let outcome = h.router.handle(text(ALICE, "admin wrong")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Silent);
        assert!(h.transport.sent().is_empty());
        let after = h.router.handle(text(ALICE, "list rules")).await.unwrap();
        assert!(matches!(after, RouteOutcome::Replied { .. }));
    }

    #[tokio::test]
    async fn add_rule_through_console() {
        let h = harness(None, Behavior::Deliver).await;
        h.router
            .handle(console("add rule mail domain shop.example -> discard"))
            .await
            .unwrap();
        let rules = h.rules.rules(Some(RuleScope::Mail)).await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].condition, ConditionType::SenderDomain);

        let msg = Message::new(Channel::Mail, "deals@shop.example", "50% off");
        assert_eq!(h.router.handle(msg).await.unwrap(), RouteOutcome::Silent);
    }

    #[tokio::test]
    async fn send_message_resolves_contact_by_name() {
        let h = harness(None, Behavior::Deliver).await;
        h.contacts
            .insert(
                Contact::new(crate::contacts::ContactSource::Operator)
                    .with_name("Ann Lee")
                    .with_phone(ALICE),
            )
            .await
            .unwrap();

        let outcome = h.router.handle(console("text ann: running late")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::OperatorHandled {
                response: format!("Sent to {ALICE}")
            }
        );
        assert_eq!(h.transport.sent()[0].body, "running late");
    }

    #[test]
    fn decision_table() {
        use ReplyPolicy::*;
        assert_eq!(decide(Channel::Direct, Automatic, RuleAction::DeferToContactPolicy), Decision::Reply);
        assert_eq!(decide(Channel::Mail, Automatic, RuleAction::DeferToContactPolicy), Decision::Notify);
        assert_eq!(decide(Channel::Mail, Automatic, RuleAction::AutoReply), Decision::Reply);
        assert_eq!(decide(Channel::Direct, Always, RuleAction::NotifyOnly), Decision::Reply);
        assert_eq!(decide(Channel::Direct, ManualReview, RuleAction::AutoReply), Decision::Review);
    }

    #[test]
    fn toggle_from_intent_fields() {
        assert_eq!(
            toggle_from_intent("all", "off"),
            Some(Toggle {
                target: ToggleTarget::All,
                enable: false
            })
        );
        assert_eq!(
            toggle_from_intent("voicemail", "on"),
            Some(Toggle {
                target: ToggleTarget::One(Channel::ForwardedVoice),
                enable: true
            })
        );
        assert_eq!(toggle_from_intent("operator", "off"), None);
        assert_eq!(toggle_from_intent("mail", "maybe"), None);
    }
}
