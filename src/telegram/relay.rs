use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use log::{debug, warn};
use teloxide::{
    payloads::setters::*,
    requests::{Request, Requester},
    types::{ChatId, InputFile, Message, MessageId, ParseMode, ReplyParameters},
    ApiError, Bot, RequestError,
};
use tokio::time::sleep;

use crate::{
    cache::{Cache, ExternalId, Msid},
    core::{Core, Sender},
    replies::{format_for_telegram, Reply},
    store::{User, RANK_ADMIN},
    util::now_ts,
};

use super::Telegram;

pub(crate) const WORKER_COUNT: usize = 1;
// Telegram's retry_after is supposedly seconds but 100+ values show up
const RATE_LIMIT_MAX_WAIT: Duration = Duration::from_secs(30);

pub(crate) type Task = BoxFuture<'static, ()>;

/// One unit of queued delivery work. `user_id` is the recipient (None for
/// answers to callers we don't know), `msid` the message being delivered
/// (None for command answers and transport deletes); both exist so that
/// deletion and stop_invoked can tombstone pending work by predicate.
pub(crate) struct QueueItem {
    pub user_id: Option<i64>,
    pub msid: Option<Msid>,
    task: Task,
}

impl QueueItem {
    pub fn new(user_id: Option<i64>, msid: Option<Msid>, task: Task) -> Self {
        Self {
            user_id,
            msid,
            task,
        }
    }

    pub async fn run(self) {
        self.task.await;
    }
}

/// What gets delivered: a verbatim copy of an incoming message, a rendered
/// HTML text (rewritten/signed messages) or a formatted reply.
#[derive(Clone)]
pub(crate) enum RelayContent {
    Copy(Arc<Message>),
    Html(String),
    Answer(Arc<Reply>),
}

/// Priority of queued work addressed to `user`. Unknown callers rank with
/// the slowest ordinary users.
pub(crate) fn priority_for(user: Option<&User>) -> u64 {
    match user {
        Some(user) => user.message_priority(now_ts()),
        None => (RANK_ADMIN as u64) << 16,
    }
}

impl Telegram {
    pub(crate) fn enqueue(&self, user: Option<&User>, msid: Option<Msid>, task: Task) {
        let item = QueueItem::new(user.map(|u| u.id), msid, task);
        self.queue.put(priority_for(user), item);
    }

    /// Queues one delivery of `content` to `recipient`, translating the
    /// reply reference into the recipient's own copy if they have one.
    pub(crate) fn send_to_single(
        &self,
        content: RelayContent,
        msid: Option<Msid>,
        recipient: &User,
        reply_msid: Option<Msid>,
    ) {
        let reply_to = reply_msid.and_then(|rm| self.cache.lookup_by_msid(recipient.id, rm));
        let bot = self.bot.clone();
        let core = self.core.clone();
        let cache = self.cache.clone();
        let chat_id = recipient.id;
        let task: Task = Box::pin(deliver(bot, core, cache, chat_id, content, msid, reply_to));
        self.enqueue(Some(recipient), msid, task);
    }

    pub fn spawn_workers(self: &Arc<Self>) {
        for _ in 0..WORKER_COUNT {
            let queue = self.queue.clone();
            tokio::spawn(async move {
                loop {
                    let item = queue.get().await;
                    item.run().await;
                }
            });
        }
    }
}

impl Sender for Telegram {
    fn reply(
        &self,
        m: Reply,
        msid: Option<Msid>,
        who: Option<&User>,
        except_who: Option<i64>,
        reply_to: Option<Msid>,
    ) {
        debug!("reply(msid={msid:?}, who={:?})", who.map(|u| u.id));
        let content = RelayContent::Answer(Arc::new(m));
        if let Some(user) = who {
            self.send_to_single(content, msid, user, reply_to);
            return;
        }
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
            if Some(user.id) == except_who && !user.debug_enabled {
                continue;
            }
            self.send_to_single(content.clone(), msid, &user, reply_to);
        }
    }

    fn delete(&self, msids: &[Msid]) {
        debug!("delete(msids={msids:?})");
        let doomed: HashSet<Msid> = msids.iter().copied().collect();
        // tombstone pending sends first so none of them land afterwards;
        // a send already executing on a worker may still slip through
        self.queue
            .delete(|item: &QueueItem| item.msid.is_some_and(|m| doomed.contains(&m)));
        let users = match self.store.users() {
            Ok(users) => users,
            Err(err) => {
                warn!("User iteration failed: {err}");
                return;
            }
        };
        for &msid in msids {
            let author = self.cache.with_message(msid, |cm| cm.user_id).flatten();
            for user in &users {
                if !user.is_joined() || Some(user.id) == author {
                    continue;
                }
                let Some(ext) = self.cache.lookup_by_msid(user.id, msid) else {
                    continue;
                };
                let bot = self.bot.clone();
                let chat = ChatId(user.id);
                let task: Task = Box::pin(async move {
                    delete_external(bot, chat, MessageId(ext)).await;
                });
                self.enqueue(Some(user), None, task);
            }
            self.cache.delete_mappings(msid);
        }
    }

    fn stop_invoked(&self, user: &User, delete_out: bool) {
        debug!("stop_invoked({}, delete_out={delete_out})", user.id);
        let uid = user.id;
        self.queue
            .delete(|item: &QueueItem| item.user_id == Some(uid));
        if !delete_out {
            return;
        }
        let mut authored = HashSet::new();
        self.cache.iterate(|msid, cm| {
            if cm.user_id == Some(uid) {
                authored.insert(msid);
            }
        });
        if !authored.is_empty() {
            self.queue
                .delete(|item: &QueueItem| item.msid.is_some_and(|m| authored.contains(&m)));
        }
    }
}

/// Delivers `content` to one chat, looping on rate limits and recording the
/// external id on success. Terminal outcomes: delivered, recipient gone
/// (force-leave), or logged failure.
pub(crate) async fn deliver(
    bot: Bot,
    core: Arc<Core>,
    cache: Arc<Cache>,
    chat_id: i64,
    content: RelayContent,
    msid: Option<Msid>,
    reply_to: Option<ExternalId>,
) {
    loop {
        match send_content(&bot, chat_id, &content, reply_to).await {
            Ok(message_id) => {
                if let Some(msid) = msid {
                    cache.save_mapping(chat_id, msid, message_id.0);
                }
                return;
            }
            Err(RequestError::RetryAfter(secs)) => {
                let delay = secs.duration().min(RATE_LIMIT_MAX_WAIT);
                warn!("API rate limit hit, waiting for {}s", delay.as_secs());
                sleep(delay).await;
            }
            Err(err) if is_peer_gone(&err) => {
                core.force_user_leave(chat_id, true);
                return;
            }
            Err(RequestError::Api(ApiError::Unknown(text)))
                if text.contains("VOICE_MESSAGES_FORBIDDEN") =>
            {
                debug!("[{chat_id}] doesn't accept voice messages");
                return;
            }
            Err(err) => {
                warn!("Failed to deliver to [{chat_id}]: {err}");
                return;
            }
        }
    }
}

fn is_peer_gone(err: &RequestError) -> bool {
    match err {
        RequestError::Api(
            ApiError::BotBlocked
            | ApiError::UserDeactivated
            | ApiError::CantInitiateConversation
            | ApiError::CantTalkWithBots,
        ) => true,
        RequestError::Api(ApiError::Unknown(text)) => text.contains("PEER_ID_INVALID"),
        _ => false,
    }
}

async fn send_content(
    bot: &Bot,
    chat_id: i64,
    content: &RelayContent,
    reply_to: Option<ExternalId>,
) -> Result<MessageId, RequestError> {
    let chat = ChatId(chat_id);
    let reply = reply_to.map(|id| ReplyParameters::new(MessageId(id)));
    let sent = match content {
        RelayContent::Html(text) => send_html(bot, chat, text, reply).await?,
        RelayContent::Answer(m) => send_html(bot, chat, &format_for_telegram(m), reply).await?,
        RelayContent::Copy(msg) => resend_message(bot, chat, msg, reply).await?,
    };
    Ok(sent.id)
}

async fn send_html(
    bot: &Bot,
    chat: ChatId,
    text: &str,
    reply: Option<ReplyParameters>,
) -> Result<Message, RequestError> {
    let req = bot.send_message(chat, text).parse_mode(ParseMode::Html);
    match reply {
        Some(r) => req.reply_parameters(r).send().await,
        None => req.send().await,
    }
}

/// Re-sends `msg` to another chat based on its content type, which is what
/// strips the sender identity. Forwards are forwarded instead so their
/// origin header survives.
async fn resend_message(
    bot: &Bot,
    chat: ChatId,
    msg: &Message,
    reply: Option<ReplyParameters>,
) -> Result<Message, RequestError> {
    if msg.forward_origin().is_some() {
        return bot.forward_message(chat, msg.chat.id, msg.id).send().await;
    }

    if let Some(text) = msg.text() {
        let req = bot.send_message(chat, text);
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(photos) = msg.photo() {
        let photo = photos
            .iter()
            .max_by_key(|p| p.width * p.height)
            .expect("photo message without sizes");
        let mut req = bot.send_photo(chat, InputFile::file_id(photo.file.id.clone()));
        if let Some(caption) = msg.caption() {
            req = req.caption(caption);
        }
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(audio) = msg.audio() {
        let mut req = bot.send_audio(chat, InputFile::file_id(audio.file.id.clone()));
        if let Some(performer) = &audio.performer {
            req = req.performer(performer);
        }
        if let Some(title) = &audio.title {
            req = req.title(title);
        }
        if let Some(caption) = msg.caption() {
            req = req.caption(caption);
        }
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(animation) = msg.animation() {
        let mut req = bot.send_animation(chat, InputFile::file_id(animation.file.id.clone()));
        if let Some(caption) = msg.caption() {
            req = req.caption(caption);
        }
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(document) = msg.document() {
        let mut req = bot.send_document(chat, InputFile::file_id(document.file.id.clone()));
        if let Some(caption) = msg.caption() {
            req = req.caption(caption);
        }
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(video) = msg.video() {
        let mut req = bot.send_video(chat, InputFile::file_id(video.file.id.clone()));
        if let Some(caption) = msg.caption() {
            req = req.caption(caption);
        }
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(voice) = msg.voice() {
        let mut req = bot.send_voice(chat, InputFile::file_id(voice.file.id.clone()));
        if let Some(caption) = msg.caption() {
            req = req.caption(caption);
        }
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(note) = msg.video_note() {
        let req = bot.send_video_note(chat, InputFile::file_id(note.file.id.clone()));
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(sticker) = msg.sticker() {
        let req = bot.send_sticker(chat, InputFile::file_id(sticker.file.id.clone()));
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(venue) = msg.venue() {
        let mut req = bot.send_venue(
            chat,
            venue.location.latitude,
            venue.location.longitude,
            &venue.title,
            &venue.address,
        );
        if let Some(foursquare_id) = &venue.foursquare_id {
            req = req.foursquare_id(foursquare_id);
        }
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(location) = msg.location() {
        let req = bot.send_location(chat, location.latitude, location.longitude);
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }
    if let Some(contact) = msg.contact() {
        let mut req = bot.send_contact(chat, &contact.phone_number, &contact.first_name);
        if let Some(last_name) = &contact.last_name {
            req = req.last_name(last_name);
        }
        return match reply {
            Some(r) => req.reply_parameters(r).send().await,
            None => req.send().await,
        };
    }

    warn!("Unsupported content type in message {}", msg.id);
    Err(RequestError::Api(ApiError::Unknown(
        "unsupported content type".into(),
    )))
}

/// Deletes one delivered copy, tolerating copies that are already gone.
async fn delete_external(bot: Bot, chat: ChatId, msg_id: MessageId) {
    loop {
        match bot.delete_message(chat, msg_id).send().await {
            Ok(_) => return,
            Err(RequestError::RetryAfter(secs)) => {
                let delay = secs.duration().min(RATE_LIMIT_MAX_WAIT);
                warn!("API rate limit hit, waiting for {}s", delay.as_secs());
                sleep(delay).await;
            }
            Err(RequestError::Api(
                ApiError::MessageToDeleteNotFound | ApiError::MessageIdInvalid,
            )) => {
                debug!("Message [{}:{}] is already gone", chat, msg_id);
                return;
            }
            Err(RequestError::Api(ApiError::MessageCantBeDeleted)) => {
                debug!("No rights to delete message in chat {chat}");
                return;
            }
            Err(err) => {
                warn!("Failed to delete message [{}:{}]: {err}", chat, msg_id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pqueue::MutablePriorityQueue;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_item(
        user_id: Option<i64>,
        msid: Option<Msid>,
        counter: Arc<AtomicU32>,
    ) -> QueueItem {
        QueueItem::new(
            user_id,
            msid,
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn test_delete_before_delivery_sends_nothing() {
        // a message fanned out to 100 recipients, deleted before any
        // worker ran: all sends are tombstoned, none execute
        let queue = MutablePriorityQueue::new();
        let sends = Arc::new(AtomicU32::new(0));
        for uid in 0..100 {
            queue.put(100, counting_item(Some(uid), Some(7), sends.clone()));
        }
        let dropped = queue.delete(|item: &QueueItem| item.msid == Some(7));
        assert_eq!(dropped, 100);

        let marker = Arc::new(AtomicU32::new(0));
        queue.put(100, counting_item(None, None, marker.clone()));
        queue.get().await.run().await;
        assert_eq!(sends.load(Ordering::SeqCst), 0);
        assert_eq!(marker.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_invoked_predicates() {
        // queued items to a user and from a user are distinguishable
        let queue = MutablePriorityQueue::new();
        let noop = Arc::new(AtomicU32::new(0));
        queue.put(1, counting_item(Some(10), Some(1), noop.clone()));
        queue.put(1, counting_item(Some(20), Some(2), noop.clone()));
        queue.put(1, counting_item(Some(10), None, noop.clone()));
        assert_eq!(queue.delete(|item: &QueueItem| item.user_id == Some(10)), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_priority_for_ranks() {
        let now = now_ts();
        let mut admin = User::new(1, now);
        admin.rank = RANK_ADMIN;
        let user = User::new(2, now);
        assert!(priority_for(Some(&admin)) < priority_for(Some(&user)));
        // unknown callers sort with (not ahead of) ordinary users
        assert!(priority_for(None) >= priority_for(Some(&user)));
        assert!(priority_for(None) > priority_for(Some(&admin)));
    }
}
