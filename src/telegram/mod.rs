pub(crate) mod relay;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, LazyLock},
    time::Duration,
};

use log::{debug, warn};
use regex::Regex;
use teloxide::{
    requests::{Request, Requester},
    types::{ChatId, Message, MessageEntityKind, Update, UpdateKind},
    Bot,
};

use crate::{
    cache::{Cache, ExternalId, Msid},
    config::Config,
    core::{Core, MessageFlags, SystemText, UserContainer},
    pqueue::MutablePriorityQueue,
    replies::Reply,
    score,
    sched::Scheduler,
    store::{UserStore, RANK_ADMIN, RANK_MOD},
    util::{escape_html, gen_tripcode},
};

use relay::{deliver, QueueItem, RelayContent, Task};

const CACHE_EXPIRY_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Cross-lounge references like `>>>/lounge/`.
static CROSS_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">>>/([A-Za-z0-9_]+)/").unwrap());

/// The Telegram side of the bot: update dispatch and the delivery queue.
/// It is also the `Sender` the core talks back through (see relay.rs).
pub struct Telegram {
    pub(crate) bot: Bot,
    pub(crate) core: Arc<Core>,
    pub(crate) store: Arc<dyn UserStore>,
    pub(crate) cache: Arc<Cache>,
    pub(crate) queue: Arc<MutablePriorityQueue<QueueItem>>,
    allow_contacts: bool,
    allow_documents: bool,
    linked_network: HashMap<String, String>,
}

impl Telegram {
    pub fn new(
        bot: Bot,
        config: &Config,
        core: Arc<Core>,
        store: Arc<dyn UserStore>,
        cache: Arc<Cache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bot,
            core,
            store,
            cache,
            queue: Arc::new(MutablePriorityQueue::new()),
            allow_contacts: config.allow_contacts,
            allow_documents: config.allow_documents,
            linked_network: config.linked_network(),
        })
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn register_tasks(self: &Arc<Self>, sched: &mut Scheduler) {
        let this = self.clone();
        sched.register(CACHE_EXPIRY_INTERVAL, "cache expiry", move || {
            let expired: HashSet<Msid> = this.cache.expire().into_iter().collect();
            if !expired.is_empty() {
                this.queue
                    .delete(|item: &QueueItem| item.msid.is_some_and(|m| expired.contains(&m)));
            }
            Ok(())
        });
    }

    pub async fn handle_update(self: &Arc<Self>, update: Update) {
        if let UpdateKind::Message(msg) = update.kind {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: Message) {
        // the lounge only exists in private chats with the bot
        if !msg.chat.is_private() {
            return;
        }
        let Some(from) = msg.from() else { return };
        if from.is_bot {
            return;
        }
        let mut realname = from.first_name.clone();
        if let Some(last_name) = &from.last_name {
            realname.push(' ');
            realname.push_str(last_name);
        }
        let c_user = UserContainer {
            id: from.id.0 as i64,
            username: from.username.clone(),
            realname,
        };

        if let Some(text) = msg.text() {
            if let Some((cmd, arg)) = parse_command(text) {
                self.dispatch_command(&msg, &c_user, &cmd, arg).await;
                return;
            }
            if text.trim() == "+1" {
                self.karma_command(&msg, &c_user);
                return;
            }
        }
        self.relay(msg, c_user);
    }

    async fn dispatch_command(self: &Arc<Self>, msg: &Message, c: &UserContainer, cmd: &str, arg: String) {
        match cmd {
            "start" => {
                let replies = self.core.user_join(c);
                self.answer_all(msg, c, replies, false);
            }
            "stop" => self.answer(msg, c, self.core.user_leave(c), false),
            "users" => self.answer(msg, c, self.core.get_users(c), false),
            "info" => {
                let reply = match self.replied_msid(msg, c) {
                    None => self.core.get_info(c),
                    Some(Ok(msid)) => self.core.get_info_mod(c, msid),
                    Some(Err(err)) => Some(err),
                };
                self.answer(msg, c, reply, true);
            }
            "motd" => {
                let reply = if arg.is_empty() {
                    self.core.get_system_text(c, SystemText::Motd)
                } else {
                    self.core.set_system_text(c, SystemText::Motd, arg)
                };
                self.answer(msg, c, reply, true);
            }
            "privacy" => {
                let reply = if arg.is_empty() {
                    self.core.get_system_text(c, SystemText::Privacy)
                } else {
                    self.core.set_system_text(c, SystemText::Privacy, arg)
                };
                self.answer(msg, c, reply, true);
            }
            "toggledebug" => self.answer(msg, c, self.core.toggle_debug(c), false),
            "togglekarma" => self.answer(msg, c, self.core.toggle_karma(c), false),
            "tripcode" => self.answer(msg, c, self.core.get_tripcode(c), true),
            "settripcode" if !arg.is_empty() => {
                self.answer(msg, c, self.core.set_tripcode(c, arg), true)
            }
            "version" | "source" => self.answer(
                msg,
                c,
                Some(Reply::ProgramVersion {
                    version: env!("CARGO_PKG_VERSION"),
                }),
                true,
            ),
            "modhelp" => self.answer(msg, c, Some(Reply::HelpModerator), true),
            "adminhelp" => self.answer(msg, c, Some(Reply::HelpAdmin), true),
            "modsay" if !arg.is_empty() => {
                let reply = self.core.send_mod_message(c, &escape_html(&arg));
                self.answer(msg, c, reply, true);
            }
            "adminsay" if !arg.is_empty() => {
                let reply = self.core.send_admin_message(c, &escape_html(&arg));
                self.answer(msg, c, reply, true);
            }
            "mod" if !arg.is_empty() => {
                let reply = self.core.promote_user(c, &arg, RANK_MOD);
                self.answer(msg, c, reply, true);
            }
            "admin" if !arg.is_empty() => {
                let reply = self.core.promote_user(c, &arg, RANK_ADMIN);
                self.answer(msg, c, reply, true);
            }
            "warn" => {
                let reply = match self.replied_msid_required(msg, c) {
                    Ok(msid) => self.core.warn_user(c, msid, false),
                    Err(err) => Some(err),
                };
                self.answer(msg, c, reply, true);
            }
            "delete" => {
                let reply = match self.replied_msid_required(msg, c) {
                    Ok(msid) => self.core.warn_user(c, msid, true),
                    Err(err) => Some(err),
                };
                self.answer(msg, c, reply, true);
            }
            "remove" => {
                let reply = match self.replied_msid_required(msg, c) {
                    Ok(msid) => self.core.delete_message(c, msid),
                    Err(err) => Some(err),
                };
                self.answer(msg, c, reply, true);
            }
            "cleanup" => self.answer(msg, c, self.core.cleanup_messages(c), true),
            "uncooldown" if !arg.is_empty() => {
                // usernames can't be this short, so it must be an id
                let (oid, username) = if arg.len() < 5 {
                    (Some(arg.as_str()), None)
                } else {
                    (None, Some(arg.as_str()))
                };
                let reply = self.core.uncooldown_user(c, oid, username);
                self.answer(msg, c, reply, true);
            }
            "blacklist" => {
                let reply = match self.replied_msid_required(msg, c) {
                    Ok(msid) => self.core.blacklist_user(c, msid, arg),
                    Err(err) => Some(err),
                };
                self.answer(msg, c, reply, true);
            }
            "s" | "sign" if !arg.is_empty() => self.relay_signed(msg, c, arg, false).await,
            "t" | "tsign" if !arg.is_empty() => self.relay_signed(msg, c, arg, true).await,
            _ => debug!("Ignoring command /{cmd}"),
        }
    }

    fn karma_command(self: &Arc<Self>, msg: &Message, c: &UserContainer) {
        let reply = match self.replied_msid_required(msg, c) {
            Ok(msid) => self.core.give_karma(c, msid),
            Err(err) => Some(err),
        };
        self.answer(msg, c, reply, true);
    }

    /// The msid the caller's replied-to message maps to, if they replied.
    fn replied_msid(&self, msg: &Message, c: &UserContainer) -> Option<Result<Msid, Reply>> {
        let replied = msg.reply_to_message()?;
        Some(
            self.cache
                .lookup_by_data(c.id, replied.id.0)
                .ok_or(Reply::ErrNotInCache),
        )
    }

    fn replied_msid_required(&self, msg: &Message, c: &UserContainer) -> Result<Msid, Reply> {
        self.replied_msid(msg, c).unwrap_or(Err(Reply::ErrNoReply))
    }

    fn answer(self: &Arc<Self>, msg: &Message, c: &UserContainer, reply: Option<Reply>, reply_to: bool) {
        if let Some(reply) = reply {
            self.answer_all(msg, c, vec![reply], reply_to);
        }
    }

    /// Queues direct command answers back to the caller, at the caller's
    /// own priority.
    fn answer_all(self: &Arc<Self>, msg: &Message, c: &UserContainer, replies: Vec<Reply>, reply_to: bool) {
        if replies.is_empty() {
            return;
        }
        let user = self.store.get_user(c.id).ok();
        let chat_id = msg.chat.id.0;
        for m in replies {
            let reply_ext: Option<ExternalId> = reply_to.then_some(msg.id.0);
            let content = RelayContent::Answer(Arc::new(m));
            let task: Task = Box::pin(deliver(
                self.bot.clone(),
                self.core.clone(),
                self.cache.clone(),
                chat_id,
                content,
                None,
                reply_ext,
            ));
            self.enqueue(user.as_ref(), None, task);
        }
    }

    /// Relays an ordinary user message to every other joined user.
    fn relay(self: &Arc<Self>, msg: Message, c: UserContainer) {
        if msg.contact().is_some() && !self.allow_contacts {
            return;
        }
        if let Some(document) = msg.document() {
            if !self.allow_documents {
                let mime_ok = document.mime_type.as_ref().is_some_and(|m| {
                    let essence = m.essence_str();
                    essence == "image/gif" || essence == "video/mp4"
                });
                if !mime_ok {
                    return;
                }
            }
        }

        let flags = MessageFlags {
            is_media: msg.text().is_none(),
            ..Default::default()
        };
        let msid = match self.core.prepare_user_message(&c, calc_spam_score(&msg), flags) {
            Ok(msid) => msid,
            Err(reply) => {
                self.answer_all(&msg, &c, vec![reply], false);
                return;
            }
        };
        let Some(user) = self.core.lookup_user(c.id) else {
            return;
        };

        let reply_msid = msg.reply_to_message().and_then(|replied| {
            let found = self.cache.lookup_by_data(user.id, replied.id.0);
            if found.is_none() {
                warn!("Message replied to not found in cache");
            }
            found
        });

        debug!("relay(): msid={msid} reply_msid={reply_msid:?}");
        let origin_ext = msg.id.0;
        let content = match augment_links(&msg, &self.linked_network) {
            Some(html) => RelayContent::Html(html),
            None => RelayContent::Copy(Arc::new(msg)),
        };
        self.fan_out(content, msid, user.id, user.debug_enabled, reply_msid, origin_ext);
    }

    /// Signed variants: the text is rebuilt as HTML with a signature or a
    /// tripcode header, so fan-out always uses the rendered form.
    async fn relay_signed(self: &Arc<Self>, msg: &Message, c: &UserContainer, arg: String, tripcode: bool) {
        let flags = MessageFlags {
            signed: !tripcode,
            tripcode,
            ..Default::default()
        };
        let msid = match self.core.prepare_user_message(c, calc_spam_score(msg), flags) {
            Ok(msid) => msid,
            Err(reply) => {
                self.answer_all(msg, c, vec![reply], true);
                return;
            }
        };
        let Some(user) = self.core.lookup_user(c.id) else {
            return;
        };

        if !tripcode {
            // a signature links the account; hidden forwards would turn it
            // into a dead link
            match self.bot.get_chat(ChatId(user.id)).send().await {
                Ok(chat) if chat.has_private_forwards().is_some() => {
                    self.answer_all(msg, c, vec![Reply::ErrSignPrivacy], true);
                    return;
                }
                Ok(_) => {}
                Err(err) => warn!("get_chat failed for {}: {err}", user.id),
            }
        }

        let html = if tripcode {
            let Some(trip) = &user.tripcode else { return };
            let (name, code) = gen_tripcode(trip);
            format!(
                "<b>{}</b> <code>{}</code>:\n{}",
                escape_html(&name),
                escape_html(&code),
                escape_html(&arg)
            )
        } else {
            format!(
                "{} <a href=\"tg://user?id={}\">~~{}</a>",
                escape_html(&arg),
                user.id,
                escape_html(&user.formatted_name())
            )
        };

        let reply_msid = msg
            .reply_to_message()
            .and_then(|replied| self.cache.lookup_by_data(user.id, replied.id.0));
        self.fan_out(
            RelayContent::Html(html),
            msid,
            user.id,
            user.debug_enabled,
            reply_msid,
            msg.id.0,
        );
    }

    fn fan_out(
        &self,
        content: RelayContent,
        msid: Msid,
        sender_id: i64,
        sender_debug: bool,
        reply_msid: Option<Msid>,
        origin_ext: ExternalId,
    ) {
        let users = match self.store.users() {
            Ok(users) => users,
            Err(err) => {
                warn!("User iteration failed: {err}");
                return;
            }
        };
        for user in users {
            if !user.is_joined() {
                continue;
            }
            if user.id == sender_id && !sender_debug {
                // no self-copy, the original message is the author's copy
                self.cache.save_mapping(user.id, msid, origin_ext);
                continue;
            }
            self.send_to_single(content.clone(), Some(msid), &user, reply_msid);
        }
    }
}

fn parse_command(text: &str) -> Option<(String, String)> {
    let rest = text.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    let (cmd, arg) = match rest.split_once(' ') {
        Some((cmd, arg)) => (cmd, arg.trim().to_owned()),
        None => (rest, String::new()),
    };
    let cmd = cmd.split('@').next().unwrap_or(cmd);
    Some((cmd.to_lowercase(), arg))
}

fn calc_spam_score(msg: &Message) -> f32 {
    if msg.forward_origin().is_some() {
        return score::SCORE_BASE_FORWARD;
    }
    if msg.sticker().is_some() {
        return score::SCORE_STICKER;
    }
    match (msg.text(), msg.caption()) {
        (Some(text), _) => score::text_score(text),
        (None, Some(caption)) if score::has_math_symbols(caption) => score::text_score(caption),
        _ => score::SCORE_BASE_MESSAGE,
    }
}

/// Appends link targets that a plain re-send would lose: inline `text_link`
/// URLs and `>>>/name/` cross-lounge references. Returns None when the
/// message can be copied verbatim.
fn augment_links(msg: &Message, linked_network: &HashMap<String, String>) -> Option<String> {
    let text = msg.text()?;
    let mut links: Vec<String> = msg
        .entities()
        .unwrap_or(&[])
        .iter()
        .filter_map(|entity| match &entity.kind {
            MessageEntityKind::TextLink { url } => Some(url.to_string()),
            _ => None,
        })
        .collect();
    for capture in CROSS_LINK.captures_iter(text) {
        if let Some(handle) = linked_network.get(&capture[1].to_lowercase()) {
            links.push(format!("https://t.me/{}", handle.trim_start_matches('@')));
        }
    }
    if links.is_empty() {
        return None;
    }
    let mut out = escape_html(text);
    out.push_str("\n\n");
    out.push_str(&links.join("\n"));
    Some(out)
}
