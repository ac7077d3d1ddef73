use anyhow::{anyhow, Result};
use bridge_api::{
    format::{format_message, format_messages_list},
    parse_timestamp,
};
use clap::{Parser, Subcommand, ValueEnum};
use shared::domain::{ChatId, ContactId, MessageId};
use storage::{ChatQuery, ChatSort, MessageQuery, Storage};

/// Offline inspection of the bridge's message store.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./store/messages.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SortBy {
    LastActive,
    Name,
}

#[derive(Subcommand, Debug)]
enum Command {
    Chats {
        #[arg(long)]
        query: Option<String>,
        #[arg(long, value_enum, default_value_t = SortBy::LastActive)]
        sort: SortBy,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        page: u32,
    },
    Messages {
        #[arg(long)]
        chat: Option<String>,
        #[arg(long)]
        sender: Option<String>,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        after: Option<String>,
        #[arg(long)]
        before: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        page: u32,
    },
    Context {
        message_id: String,
        #[arg(long)]
        chat: Option<String>,
        #[arg(long, default_value_t = 5)]
        before: u32,
        #[arg(long, default_value_t = 5)]
        after: u32,
    },
    Contacts {
        query: String,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    LastInteraction {
        contact_id: String,
    },
    Reactions {
        chat_id: String,
        message_id: String,
    },
    Count {
        #[arg(long)]
        chat: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Chats {
            query,
            sort,
            limit,
            page,
        } => {
            let chats = storage
                .list_chats(&ChatQuery {
                    query,
                    limit,
                    page,
                    include_last_message: true,
                    sort: match sort {
                        SortBy::LastActive => ChatSort::LastActive,
                        SortBy::Name => ChatSort::Name,
                    },
                })
                .await?;
            for chat in chats {
                let last = chat
                    .last_message
                    .as_ref()
                    .and_then(|last| last.text.as_deref())
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{last}",
                    chat.chat_id,
                    chat.name.as_deref().unwrap_or("-"),
                    chat.last_activity
                        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        Command::Messages {
            chat,
            sender,
            query,
            after,
            before,
            limit,
            page,
        } => {
            let query = MessageQuery {
                after: after.as_deref().map(|raw| parse_timestamp("after", raw)).transpose()?,
                before: before
                    .as_deref()
                    .map(|raw| parse_timestamp("before", raw))
                    .transpose()?,
                sender,
                chat_id: chat.map(ChatId::new),
                text: query,
                limit,
                page,
            };
            let messages = storage.list_messages(&query).await?;
            print!("{}", format_messages_list(&storage, &messages, true).await?);
        }
        Command::Context {
            message_id,
            chat,
            before,
            after,
        } => {
            let message_id = MessageId::new(message_id);
            let chat_id = match chat {
                Some(chat) => ChatId::new(chat),
                None => storage
                    .message_by_id(&message_id)
                    .await?
                    .map(|message| message.chat_id)
                    .ok_or_else(|| anyhow!("message {message_id} not found"))?,
            };
            let context = storage
                .message_context(&chat_id, &message_id, before, after)
                .await?
                .ok_or_else(|| anyhow!("message {message_id} not found in {chat_id}"))?;
            let mut window = context.before;
            window.push(context.message);
            window.extend(context.after);
            print!("{}", format_messages_list(&storage, &window, true).await?);
        }
        Command::Contacts { query, limit } => {
            for contact in storage.search_contacts(&query, limit).await? {
                println!(
                    "{}\t{}\t{}",
                    contact.contact_id,
                    contact.phone_number(),
                    contact.name.as_deref().unwrap_or("-")
                );
            }
        }
        Command::LastInteraction { contact_id } => {
            match storage
                .last_interaction(&ContactId::new(contact_id))
                .await?
            {
                Some(message) => print!("{}", format_message(&storage, &message, true).await?),
                None => println!("no interactions"),
            }
        }
        Command::Reactions {
            chat_id,
            message_id,
        } => {
            let reactions = storage
                .reactions(&ChatId::new(chat_id), &MessageId::new(message_id))
                .await?;
            for reaction in reactions {
                println!(
                    "{}\t{}\t{}",
                    reaction.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    reaction.reactor_id,
                    reaction.emoji
                );
            }
        }
        Command::Count { chat } => {
            let chat_id = chat.map(ChatId::new);
            println!("{}", storage.count_messages(chat_id.as_ref()).await?);
        }
    }

    Ok(())
}
