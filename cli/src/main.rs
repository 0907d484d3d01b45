//! chat-ctl: command-line client mapping one-to-one to the server's HTTP
//! endpoints. Prints the HTTP status line and response body; exits non-zero
//! on transport failure or a non-2xx response.

use clap::{Args, Parser, Subcommand};
use reqwest::{Client, RequestBuilder, Response};

#[derive(Debug, Parser)]
#[command(name = "chat-ctl", about = "Command-line client for the groupchat server", version)]
struct Cli {
    /// Base URL of the chat server
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// User management
    #[command(subcommand)]
    User(UserCommand),
    /// Room management
    #[command(subcommand)]
    Room(RoomCommand),
    /// Messaging
    #[command(subcommand)]
    Message(MessageCommand),
}

#[derive(Debug, Args)]
struct TokenArg {
    /// Bearer token obtained from `user login`
    #[arg(long)]
    token: String,
}

#[derive(Debug, Args)]
struct PageArgs {
    /// Page index; negative counts from the end
    #[arg(long = "page-index", default_value_t = 0)]
    page_index: i64,
    /// Page size
    #[arg(long = "page-size", default_value_t = 10)]
    page_size: i64,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// Create a new user
    Create {
        #[arg(long)]
        username: String,
        #[arg(long, default_value = "")]
        firstname: String,
        #[arg(long, default_value = "")]
        lastname: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "")]
        phone: String,
    },
    /// Query information of a user
    Query {
        #[arg(long)]
        username: String,
    },
    /// Login and print a bearer token
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
}

#[derive(Debug, Subcommand)]
enum RoomCommand {
    /// Create a new room, printing its id
    Create {
        #[arg(long)]
        name: String,
        #[command(flatten)]
        token: TokenArg,
    },
    /// Query a room's name
    Query {
        #[arg(long)]
        id: i64,
    },
    /// List rooms, newest first
    List {
        #[command(flatten)]
        page: PageArgs,
    },
    /// List usernames in a room
    Users {
        #[arg(long)]
        id: i64,
    },
    /// Enter a room
    Enter {
        #[arg(long)]
        id: i64,
        #[command(flatten)]
        token: TokenArg,
    },
    /// Leave the current room
    Leave {
        #[command(flatten)]
        token: TokenArg,
    },
}

#[derive(Debug, Subcommand)]
enum MessageCommand {
    /// Send a message to the current room
    Send {
        #[arg(long)]
        id: String,
        #[arg(long)]
        text: String,
        #[command(flatten)]
        token: TokenArg,
    },
    /// Retrieve messages from the current room, newest first
    Retrieve {
        #[command(flatten)]
        page: PageArgs,
        #[command(flatten)]
        token: TokenArg,
    },
}

fn page_body(page: &PageArgs) -> serde_json::Value {
    serde_json::json!({"pageIndex": page.page_index, "pageSize": page.page_size})
}

fn build_request(client: &Client, addr: &str, command: &Commands) -> RequestBuilder {
    match command {
        Commands::User(cmd) => match cmd {
            UserCommand::Create {
                username,
                firstname,
                lastname,
                email,
                password,
                phone,
            } => client.post(format!("{addr}/user")).json(&serde_json::json!({
                "username": username,
                "firstName": firstname,
                "lastName": lastname,
                "email": email,
                "password": password,
                "phone": phone,
            })),
            UserCommand::Query { username } => client.get(format!("{addr}/user/{username}")),
            UserCommand::Login { username, password } => client
                .get(format!("{addr}/userLogin"))
                .query(&[("username", username), ("password", password)]),
        },
        Commands::Room(cmd) => match cmd {
            RoomCommand::Create { name, token } => client
                .post(format!("{addr}/room"))
                .bearer_auth(&token.token)
                .json(&serde_json::json!({"name": name})),
            RoomCommand::Query { id } => client.get(format!("{addr}/room/{id}")),
            RoomCommand::List { page } => {
                client.post(format!("{addr}/roomList")).json(&page_body(page))
            }
            RoomCommand::Users { id } => client.get(format!("{addr}/room/{id}/users")),
            RoomCommand::Enter { id, token } => client
                .put(format!("{addr}/room/{id}/enter"))
                .bearer_auth(&token.token),
            RoomCommand::Leave { token } => client
                .put(format!("{addr}/roomLeave"))
                .bearer_auth(&token.token),
        },
        Commands::Message(cmd) => match cmd {
            MessageCommand::Send { id, text, token } => client
                .post(format!("{addr}/message/send"))
                .bearer_auth(&token.token)
                .json(&serde_json::json!({"id": id, "text": text})),
            MessageCommand::Retrieve { page, token } => client
                .post(format!("{addr}/message/retrieve"))
                .bearer_auth(&token.token)
                .json(&page_body(page)),
        },
    }
}

async fn print_response(resp: Response) -> anyhow::Result<bool> {
    let status = resp.status();
    let body = resp.text().await?;
    println!("{status}");
    println!("{}", body.trim_end_matches('\n'));
    Ok(status.is_success())
}

async fn run() -> anyhow::Result<bool> {
    let cli = Cli::parse();
    let addr = cli.addr.trim_end_matches('/').to_string();
    let client = Client::new();
    let resp = build_request(&client, &addr, &cli.command).send().await?;
    print_response(resp).await
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
