use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{arg, ArgAction, ArgMatches, Command};
use failure::{format_err, Fail};
use libp2p::{identity, Multiaddr, PeerId};
use log::info;

use crate::authority::{CertificateAuthority, LocalAuthority};
use crate::config::NodeConfig;
use crate::constants::*;
use crate::message::{Request, Response};
use crate::pow::Miner;
use crate::rpc::{Network, PeerClient};
use crate::server::Server;
use crate::transaction::Transaction;
use crate::wallet::{parse_public_key, Wallet};

pub struct Cli {}

impl Cli {
    pub fn new() -> Result<Cli, Box<dyn std::error::Error>> {
        Ok(Cli {})
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let matches = Command::new("keyledger")
            .version("0.1")
            .about("a proof-of-work ledger of email to public key registrations")
            .subcommand_required(true)
            .subcommand(
                Command::new("genkey")
                    .about("create a key file and print its public key")
                    .arg(arg!(<PATH> "'where to write the key file'")),
            )
            .subcommand(
                Command::new("startnode")
                    .about("start a node")
                    .arg(
                        arg!(--"ca-pub" <HEX> "'public key of the certificate authority'")
                            .required(true),
                    )
                    .arg(
                        arg!(--listen <ADDR> "'multiaddr to listen on'")
                            .default_value(DEFAULT_LISTEN),
                    )
                    .arg(
                        arg!(--peer <ADDR> "'multiaddr of a peer, repeatable'")
                            .action(ArgAction::Append),
                    )
                    .arg(arg!(--key <PATH> "'key file giving the node a stable peer id'"))
                    .arg(arg!(--difficulty <BITS> "'leading zero bits required of a block hash'"))
                    .arg(arg!(--"queue-capacity" <N> "'inbound block queue size'"))
                    .arg(arg!(--"block-size" <N> "'transactions per block'")),
            )
            .subcommand(
                Command::new("register")
                    .about("register a public key for an email, signed by the CA")
                    .arg(arg!(--node <ADDR> "'node to submit to'").required(true))
                    .arg(arg!(--"ca-key" <PATH> "'certificate authority key file'").required(true))
                    .arg(arg!(--email <EMAIL> "'email to register'").required(true))
                    .arg(
                        arg!(--key <PATH> "'key file holding the key to register'").required(true),
                    ),
            )
            .subcommand(
                Command::new("update")
                    .about("replace the public key registered for an email")
                    .arg(arg!(--node <ADDR> "'node to submit to'").required(true))
                    .arg(arg!(--email <EMAIL> "'registered email'").required(true))
                    .arg(
                        arg!(--"old-key" <PATH> "'key file of the currently registered key'")
                            .required(true),
                    )
                    .arg(arg!(--key <PATH> "'key file holding the new key'").required(true)),
            )
            .subcommand(
                Command::new("lookup")
                    .about("print the public key registered for an email")
                    .arg(arg!(--node <ADDR> "'node to ask'").required(true))
                    .arg(arg!(--email <EMAIL> "'email to look up'").required(true)),
            )
            .get_matches();

        if let Some(matches) = matches.subcommand_matches("genkey") {
            let path = required(matches, "PATH")?;
            let wallet = Wallet::new();
            wallet.save(Path::new(path))?;
            println!("public key: {}", hex::encode(&wallet.public_key));
            println!("peer id: {}", PeerId::from(node_keypair(&wallet)?.public()));
        }

        if let Some(matches) = matches.subcommand_matches("startnode") {
            let key = matches.get_one::<String>("key").map(Path::new);
            cmd_start_node(node_config(matches)?, key).await?;
        }

        if let Some(matches) = matches.subcommand_matches("register") {
            let ca_key = Wallet::load(Path::new(required(matches, "ca-key")?))?;
            let authority = LocalAuthority::new(ca_key);
            let owner = Wallet::load(Path::new(required(matches, "key")?))?;
            let email = required(matches, "email")?;
            info!("registering {} with authority {}", email, hex::encode(authority.public_key()));
            let tx = Transaction::new_register(email, owner.public_key.clone(), &authority)
                .map_err(|e| e.compat())?;
            submit(required(matches, "node")?, tx).await?;
            println!("registration for {} submitted", email);
        }

        if let Some(matches) = matches.subcommand_matches("update") {
            let old = Wallet::load(Path::new(required(matches, "old-key")?))?;
            let new = Wallet::load(Path::new(required(matches, "key")?))?;
            let email = required(matches, "email")?;
            let tx = Transaction::new_update(email, new.public_key.clone(), &old)
                .map_err(|e| e.compat())?;
            submit(required(matches, "node")?, tx).await?;
            println!("update for {} submitted", email);
        }

        if let Some(matches) = matches.subcommand_matches("lookup") {
            let email = required(matches, "email")?;
            match call_node(required(matches, "node")?, Request::get_public_key(email)).await? {
                Response::PublicKey(Some(key)) => println!("{}: {}", email, hex::encode(key)),
                Response::PublicKey(None) => println!("{} is not registered", email),
                other => {
                    return Err(format_err!("unexpected answer: {:?}", other).compat().into())
                }
            }
        }
        Ok(())
    }
}

fn required<'a>(
    matches: &'a ArgMatches,
    name: &str,
) -> Result<&'a str, Box<dyn std::error::Error>> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| format_err!("missing argument {}", name).compat().into())
}

fn parse_number<T: std::str::FromStr>(
    matches: &ArgMatches,
    name: &str,
) -> Result<Option<T>, Box<dyn std::error::Error>> {
    match matches.get_one::<String>(name) {
        Some(text) => match text.parse() {
            Ok(n) => Ok(Some(n)),
            Err(_) => {
                let reason = format_err!("--{} expects a number, got {}", name, text);
                Err(reason.compat().into())
            }
        },
        None => Ok(None),
    }
}

fn node_config(matches: &ArgMatches) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = NodeConfig::new(parse_public_key(required(matches, "ca-pub")?)?);
    config.listen = required(matches, "listen")?.parse()?;
    if let Some(peers) = matches.get_many::<String>("peer") {
        for peer in peers {
            config.peers.push(peer.parse()?);
        }
    }
    if let Some(bits) = parse_number(matches, "difficulty")? {
        config.difficulty = bits;
    }
    if let Some(n) = parse_number(matches, "queue-capacity")? {
        config.queue_capacity = n;
    }
    if let Some(n) = parse_number::<usize>(matches, "block-size")? {
        config.block_transactions = n.max(1);
    }
    Ok(config)
}

/// The libp2p identity derived from a key file's seed.
fn node_keypair(wallet: &Wallet) -> Result<identity::Keypair, Box<dyn std::error::Error>> {
    let mut seed = *wallet.seed();
    Ok(identity::Keypair::ed25519_from_bytes(&mut seed)?)
}

async fn cmd_start_node(
    config: NodeConfig,
    key: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let keypair = match key {
        Some(path) => node_keypair(&Wallet::load(path)?)?,
        None => identity::Keypair::generate_ed25519(),
    };
    info!(
        "starting node: difficulty {} bits, {} peers, {} transactions per block",
        config.difficulty,
        config.peers.len(),
        config.block_transactions
    );

    let alive = Arc::new(AtomicBool::new(true));
    let (mut network, client, inbound) =
        Network::new(keypair, Some(config.listen.clone()), config.rpc_timeout, alive.clone())?;
    match network.listen_address().await {
        Some(addr) => info!("node {} listening on {}", network.local_peer_id(), addr),
        None => return Err(format_err!("could not listen on {}", config.listen).compat().into()),
    }
    let (miner, handle) = Miner::new(config.difficulty, alive.clone());
    let miner = miner.with_poll_interval(config.poll_interval);
    let server = Arc::new(Server::new(config, client.clone(), handle, alive.clone()));

    let network = tokio::spawn(network.run());
    let tasks = server.start(miner, inbound, client);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown();
    network.await?;
    tasks.join().await;
    Ok(())
}

/// Sends one request through a short-lived network task.
async fn call_node(
    node: &str,
    request: Request,
) -> Result<Response, Box<dyn std::error::Error>> {
    let node: Multiaddr = node.parse()?;
    let alive = Arc::new(AtomicBool::new(true));
    let (network, client, _inbound) =
        Network::new(identity::Keypair::generate_ed25519(), None, RPC_TIMEOUT, alive.clone())?;
    let network = tokio::spawn(network.run());
    let result = client.call(&node, request).await;
    alive.store(false, Ordering::SeqCst);
    network.await?;
    Ok(result.map_err(|e| e.compat())?)
}

async fn submit(node: &str, tx: Transaction) -> Result<(), Box<dyn std::error::Error>> {
    match call_node(node, Request::submit(tx)).await? {
        Response::Accepted => Ok(()),
        Response::Rejected(reason) => {
            Err(format_err!("node refused the transaction: {}", reason).compat().into())
        }
        other => Err(format_err!("unexpected answer: {:?}", other).compat().into()),
    }
}
