/// CLI for one-shot ChatSync requests against the messaging API
use chatsync_core::api::{HttpMessageApi, MessageApi};
use chatsync_core::conversation::{ConversationAggregator, DisplayInfo};
use chatsync_core::display::{display_name, preview, relative_time};
use chatsync_core::messenger_types::{Message, UserId};
use chatsync_core::unread::badge_text;
use chatsync_core::validation::build_send_request;
use chatsync_core::Config;
use chrono::Utc;
use colored::*;
use futures_util::future::join_all;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let (config, rest) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = rest.first() else {
        print_usage();
        return Ok(());
    };

    let api = HttpMessageApi::new(&config)?;

    match command.as_str() {
        "whoami" => whoami(&api).await?,
        "conversations" => {
            let page = match rest.get(1) {
                Some(p) => p.parse()?,
                None => 0,
            };
            list_conversations(&api, &config, page).await?;
        }
        "thread" => {
            let Some(counterpart) = rest.get(1) else {
                eprintln!("{}", usage("thread <user_id> [since_ms]"));
                return Ok(());
            };
            let since_ms = match rest.get(2) {
                Some(ms) => Some(ms.parse()?),
                None => None,
            };
            show_thread(&api, counterpart.parse()?, since_ms).await?;
        }
        "send" => {
            if rest.len() < 3 {
                eprintln!("{}", usage("send <user_id> <message>"));
                return Ok(());
            }
            let to: UserId = rest[1].parse()?;
            let content = rest[2..].join(" ");
            send_message(&api, &config, to, &content).await?;
        }
        "read" => {
            let Some(counterpart) = rest.get(1) else {
                eprintln!("{}", usage("read <user_id>"));
                return Ok(());
            };
            api.mark_conversation_read(counterpart.parse()?).await?;
            println!("{} Conversation marked read", "✓".green().bold());
        }
        "read-message" => {
            let Some(id) = rest.get(1) else {
                eprintln!("{}", usage("read-message <message_id>"));
                return Ok(());
            };
            api.mark_message_read(id.parse()?).await?;
            println!("{} Message marked read", "✓".green().bold());
        }
        "unread" => {
            let total = api.unread_count().await?;
            println!("Unread: {}", badge_text(total, config.badge_cap).bold());
        }
        other => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), other.red());
            print_usage();
        }
    }

    Ok(())
}

fn usage(args: &str) -> String {
    format!("Usage: {} {}", env!("CARGO_BIN_NAME"), args)
}

fn print_usage() {
    println!("{}", "ChatSync CLI".bold());
    println!();
    println!("{}", usage("[--base-url URL] [--token TOKEN] <command> [args]"));
    println!();
    println!("Commands:");
    println!("  whoami                      Show the signed-in user");
    println!("  conversations [page]        List conversations");
    println!("  thread <user_id> [since_ms] Show the thread with a user");
    println!("  send <user_id> <message>    Send a message");
    println!("  read <user_id>              Mark a conversation read");
    println!("  read-message <message_id>   Mark one message read");
    println!("  unread                      Show the unread total");
}

async fn current_user(api: &HttpMessageApi) -> anyhow::Result<UserId> {
    api.current_user()
        .await?
        .id
        .ok_or_else(|| anyhow::anyhow!("server did not return a user id"))
}

async fn whoami(api: &HttpMessageApi) -> anyhow::Result<()> {
    let me = api.current_user().await?;
    println!("User ID:  {}", me.id.map(|id| id.to_string()).unwrap_or_else(|| "?".into()).cyan());
    if let Some(nickname) = me.nickname {
        println!("Nickname: {}", nickname);
    }
    Ok(())
}

async fn list_conversations(api: &HttpMessageApi, config: &Config, page: u32) -> anyhow::Result<()> {
    let me = current_user(api).await?;
    let body = api.conversations(page, config.page_size).await?;

    let mut table = ConversationAggregator::new(config.page_size);
    let outcome = table.merge_page(body.content, me);
    if outcome.skipped > 0 {
        eprintln!("{} {} unreadable message(s) skipped", "!".yellow().bold(), outcome.skipped);
    }

    let requested = table.take_profile_requests();
    let lookups = join_all(requested.iter().map(|id| api.user_profile(*id))).await;
    for (counterpart, lookup) in requested.into_iter().zip(lookups) {
        // Best effort: a failed lookup keeps the placeholder
        if let Ok(profile) = lookup {
            table.apply_profile(
                counterpart,
                DisplayInfo {
                    name: profile.nickname.unwrap_or_default(),
                    avatar_url: profile.avatar_url.unwrap_or_default(),
                },
            );
        }
    }

    let conversations = table.sort_for_display();
    if conversations.is_empty() {
        println!("No conversations");
        return Ok(());
    }

    let now = Utc::now();
    println!("Conversations (page {}):", page);
    println!("{:-<60}", "");
    for conversation in &conversations {
        let name = display_name(conversation, &config.display_name_placeholder);
        let unread = if conversation.unread_count > 0 {
            format!(" [{}]", badge_text(conversation.unread_count, config.badge_cap))
                .red()
                .bold()
                .to_string()
        } else {
            String::new()
        };
        println!(
            "  {} ({}){}  {}",
            name.bold(),
            conversation.counterpart_user_id,
            unread,
            relative_time(conversation.last_message.created_at, now).dimmed()
        );
        println!("      {}", preview(conversation, 50));
    }
    if body.has_next {
        println!("{}", format!("More: conversations {}", page + 1).dimmed());
    }
    Ok(())
}

async fn show_thread(api: &HttpMessageApi, counterpart: UserId, since_ms: Option<i64>) -> anyhow::Result<()> {
    let me = current_user(api).await?;
    let raw = match since_ms {
        Some(ms) => api.thread_since(counterpart, ms).await?,
        None => api.thread(counterpart).await?,
    };
    let mut messages: Vec<Message> = raw
        .into_iter()
        .filter_map(|raw| raw.normalize().ok())
        .collect();
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let now = Utc::now();
    for message in &messages {
        let who = if message.from_user == me {
            "me".green().bold()
        } else {
            message.from_user.to_string().cyan().bold()
        };
        println!(
            "{} {}: {}",
            relative_time(message.created_at, now).dimmed(),
            who,
            message.content
        );
    }
    Ok(())
}

async fn send_message(
    api: &HttpMessageApi,
    config: &Config,
    to: UserId,
    content: &str,
) -> anyhow::Result<()> {
    let request = build_send_request(content, to, None, config.max_message_len, &config.blocked_words)?;
    let sent = api.send(&request).await?;
    match sent.id {
        Some(id) => println!("{} Message sent! ID: {}", "✓".green().bold(), id.to_string().cyan()),
        None => println!("{} Message sent!", "✓".green().bold()),
    }
    Ok(())
}
