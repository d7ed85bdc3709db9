use crate::util::{escape_html, format_datetime, format_duration};

/// Everything the bot can say back to a user. Produced by the core as
/// plain values; rendered to Telegram HTML only at send time.
#[derive(Clone, Debug)]
pub enum Reply {
    Custom { text: String },
    Success,
    BooleanConfig { description: &'static str, enabled: bool },

    ChatJoin,
    ChatLeave,
    UserInChat,
    UserNotInChat,
    GivenCooldown { duration: i64, deleted: bool },
    MessageDeleted,
    DeletionQueued { count: usize },
    PromotedMod,
    PromotedAdmin,
    KarmaThankYou,
    KarmaNotification,
    TripcodeInfo { tripcode: Option<String> },
    TripcodeSet { name: String, code: String },

    ErrCommandDisabled,
    ErrNoReply,
    ErrNotInCache,
    ErrNoUser,
    ErrNoUserById,
    ErrAlreadyWarned,
    ErrNotInCooldown,
    ErrCooldown { until: i64 },
    ErrBlacklisted { reason: Option<String>, contact: String },
    ErrAlreadyUpvoted,
    ErrUpvoteOwnMessage,
    ErrSpammy,
    ErrSpammySign,
    ErrSignPrivacy,
    ErrInvalidTripFormat,
    ErrNoTripcode,
    ErrMediaLimit,

    UserInfo {
        oid: String,
        username: String,
        rank: i32,
        rank_name: &'static str,
        karma: i64,
        warnings: u32,
        warn_expiry: Option<i64>,
        cooldown: Option<i64>,
    },
    UserInfoMod {
        oid: String,
        karma: i64,
        cooldown: Option<i64>,
    },
    UsersInfo {
        count: usize,
    },
    UsersInfoExtended {
        active: usize,
        inactive: usize,
        blacklisted: usize,
    },

    ProgramVersion { version: &'static str },
    HelpModerator,
    HelpAdmin,
}

fn smiley(warnings: u32) -> &'static str {
    match warnings {
        0 => ":)",
        1 => ":|",
        2..=3 => ":/",
        _ => ":(",
    }
}

fn cooldown_text(cooldown: Option<i64>) -> String {
    match cooldown {
        Some(until) => format!("yes, until {}", format_datetime(until)),
        None => "no".into(),
    }
}

/// Renders a reply as Telegram HTML.
pub fn format_for_telegram(m: &Reply) -> String {
    use Reply::*;
    match m {
        Custom { text } => text.clone(),
        Success => "\u{2611}".into(),
        BooleanConfig { description, enabled } => format!(
            "<b>{}</b>: {}",
            escape_html(description),
            if *enabled { "enabled" } else { "disabled" }
        ),

        ChatJoin => "<em>You joined the chat!</em>".into(),
        ChatLeave => "<em>You left the chat!</em>".into(),
        UserInChat => "<em>You're already in the chat.</em>".into(),
        UserNotInChat => "<em>You're not in the chat yet. Use</em> /start <em>to join!</em>".into(),
        GivenCooldown { duration, deleted } => format!(
            "<em>You've been handed a cooldown of {} for this message{}</em>",
            format_duration(*duration),
            if *deleted { " (message also deleted)" } else { "" }
        ),
        MessageDeleted => "<em>Your message has been deleted. No cooldown has been given this \
            time, but refrain from posting it again.</em>"
            .into(),
        DeletionQueued { count } => {
            format!("<em>{count} messages matched, deletion was queued.</em>")
        }
        PromotedMod => "<em>You've been promoted to moderator, run</em> /modhelp <em>for a list \
            of commands.</em>"
            .into(),
        PromotedAdmin => "<em>You've been promoted to admin, run</em> /adminhelp <em>for a list \
            of commands.</em>"
            .into(),
        KarmaThankYou => "<em>You just gave this user some sweet karma, awesome!</em>".into(),
        KarmaNotification => "<em>You've just been given sweet karma! (check</em> /info <em>to \
            see your karma or</em> /togglekarma <em>to turn these notifications off)</em>"
            .into(),
        TripcodeInfo { tripcode } => match tripcode {
            Some(t) => format!("<b>tripcode</b>: <code>{}</code>", escape_html(t)),
            None => "<b>tripcode</b>: unset".into(),
        },
        TripcodeSet { name, code } => format!(
            "<em>Tripcode set. It will appear as:</em> <b>{}</b> <code>{}</code>",
            escape_html(name),
            escape_html(code)
        ),

        ErrCommandDisabled => "<em>This command has been disabled.</em>".into(),
        ErrNoReply => "<em>You need to reply to a message to use this command.</em>".into(),
        ErrNotInCache => {
            "<em>Message not found in cache... (24h passed or bot was restarted)</em>".into()
        }
        ErrNoUser => "<em>No user found by that name!</em>".into(),
        ErrNoUserById => {
            "<em>No user found by that id! Note that all ids rotate every 24 hours.</em>".into()
        }
        ErrAlreadyWarned => "<em>A warning has already been issued for this message.</em>".into(),
        ErrNotInCooldown => "<em>This user is not in a cooldown right now.</em>".into(),
        ErrCooldown { until } => format!(
            "<em>Your cooldown expires at {}</em>",
            format_datetime(*until)
        ),
        ErrBlacklisted { reason, contact } => {
            let mut s = String::from("<em>You've been blacklisted</em>");
            if let Some(reason) = reason.as_deref().filter(|r| !r.is_empty()) {
                s.push_str(&format!(" <em>for {}</em>", escape_html(reason)));
            }
            if !contact.is_empty() {
                s.push_str(&format!("\n<em>contact:</em> {contact}"));
            }
            s
        }
        ErrAlreadyUpvoted => "<em>You have already upvoted this message.</em>".into(),
        ErrUpvoteOwnMessage => "<em>You can't upvote your own message.</em>".into(),
        ErrSpammy => "<em>Your message has not been sent. Avoid sending messages too fast, try \
            again later.</em>"
            .into(),
        ErrSpammySign => "<em>Your message has not been sent. Avoid using</em> /sign <em>too \
            often, try again later.</em>"
            .into(),
        ErrSignPrivacy => "<em>Your account privacy settings prevent usage of the sign feature. \
            Enable linked forwards first.</em>"
            .into(),
        ErrInvalidTripFormat => "<em>Given tripcode is not valid, the format is</em> \
            <code>name#pass</code><em>.</em>"
            .into(),
        ErrNoTripcode => "<em>You don't have a tripcode set.</em>".into(),
        ErrMediaLimit => "<em>You can't send media or forward messages at this time, try again \
            later.</em>"
            .into(),

        UserInfo {
            oid,
            username,
            rank,
            rank_name,
            karma,
            warnings,
            warn_expiry,
            cooldown,
        } => {
            let expiry = match warn_expiry {
                Some(t) if *warnings > 0 => {
                    format!(" (one warning will be removed on {})", format_datetime(*t))
                }
                _ => String::new(),
            };
            format!(
                "<b>id</b>: {}, <b>username</b>: {}, <b>rank</b>: {} ({})\n\
                 <b>karma</b>: {}\n\
                 <b>warnings</b>: {} {}{}, <b>cooldown</b>: {}",
                oid,
                escape_html(username),
                rank,
                rank_name,
                karma,
                warnings,
                smiley(*warnings),
                expiry,
                cooldown_text(*cooldown)
            )
        }
        UserInfoMod { oid, karma, cooldown } => format!(
            "<b>id</b>: {}, <b>username</b>: anonymous, <b>rank</b>: n/a, \
             <b>karma bracket</b>: {}\n<b>cooldown</b>: {}",
            oid,
            karma,
            cooldown_text(*cooldown)
        ),
        UsersInfo { count } => format!("<b>{count}</b> <i>users</i>"),
        UsersInfoExtended {
            active,
            inactive,
            blacklisted,
        } => format!(
            "<b>{active}</b> <i>active</i>, {inactive} <i>inactive and</i> {blacklisted} \
             <i>blacklisted users</i> (<i>total</i>: {})",
            active + inactive + blacklisted
        ),

        ProgramVersion { version } => format!("parlor v{version}"),
        HelpModerator => "<i>Moderators can use the following commands</i>:\n\
            \x20 /modhelp - show this text\n\
            \x20 /modsay &lt;message&gt; - send an official moderator message\n\
            \n\
            <i>Or reply to a message and use</i>:\n\
            \x20 /info - get info about the user that sent this message\n\
            \x20 /warn - warn the user that sent this message (cooldown)\n\
            \x20 /delete - delete a message and warn the user\n\
            \x20 /remove - delete a message without a cooldown/warning"
            .into(),
        HelpAdmin => "<i>Admins can use the following commands</i>:\n\
            \x20 /adminhelp - show this text\n\
            \x20 /adminsay &lt;message&gt; - send an official admin message\n\
            \x20 /motd &lt;message&gt; - set the welcome message (HTML formatted)\n\
            \x20 /uncooldown &lt;id | username&gt; - remove cooldown from an user\n\
            \x20 /mod &lt;username&gt; - promote an user to the moderator rank\n\
            \x20 /admin &lt;username&gt; - promote an user to the admin rank\n\
            \x20 /cleanup - mass delete messages by currently banned users\n\
            \n\
            <i>Or reply to a message and use</i>:\n\
            \x20 /blacklist [reason] - blacklist the user who sent this message"
            .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escaping_in_params() {
        let s = format_for_telegram(&Reply::Custom {
            text: "<b>kept as-is</b>".into(),
        });
        assert_eq!(s, "<b>kept as-is</b>");

        let s = format_for_telegram(&Reply::ErrBlacklisted {
            reason: Some("being <evil>".into()),
            contact: "@admin".into(),
        });
        assert!(s.contains("&lt;evil&gt;"));
        assert!(s.contains("@admin"));

        let s = format_for_telegram(&Reply::ErrBlacklisted {
            reason: None,
            contact: String::new(),
        });
        assert!(!s.contains("contact"));
    }

    #[test]
    fn test_cooldown_rendering() {
        let s = format_for_telegram(&Reply::GivenCooldown {
            duration: 300,
            deleted: false,
        });
        assert!(s.contains("5m"));
        assert!(!s.contains("deleted"));
        let s = format_for_telegram(&Reply::GivenCooldown {
            duration: 300,
            deleted: true,
        });
        assert!(s.contains("(message also deleted)"));
    }

    #[test]
    fn test_user_info() {
        let s = format_for_telegram(&Reply::UserInfo {
            oid: "a1b2".into(),
            username: "@alice".into(),
            rank: 10,
            rank_name: "mod",
            karma: 7,
            warnings: 0,
            warn_expiry: None,
            cooldown: None,
        });
        assert!(s.contains("a1b2"));
        assert!(s.contains("10 (mod)"));
        assert!(s.contains(":)"));
        assert!(s.contains("<b>cooldown</b>: no"));
    }
}
