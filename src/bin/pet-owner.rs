use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use actix::System;
use clap::Parser;
use cp_raft::cluster::ClusterRunner;
use cp_raft::{Config, CpClient, CpError, CpStateMachine, Pet, PetOwner, PhotoWatcher, PrimitiveNames, ShutdownSignal};
use futures::future::join_all;
use log::{error, info, warn};

#[derive(Parser)]
#[command(name = "pet-owner")]
#[command(about = "Pet owners compete for a fenced lock, the leader publishes pet photos to the whole group")]
struct Cli {
    /// Pet to publish photos of: cat|dog
    pet: String,

    /// Competing owners to start
    #[arg(long, default_value_t = 2)]
    owners: u32,

    /// Servers in the consensus group, overrides the config file
    #[arg(long)]
    members: Option<u8>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Publish without contending for the lock
    #[arg(long)]
    unelected: bool,

    /// Publications per leadership before handing the lock on; leads forever when unset
    #[arg(long)]
    publications: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let pet: Pet = match cli.pet.parse() {
        Ok(pet) => pet,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };
    let mut config = match cli.config.as_ref().map(Config::from_file).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };
    if let Some(members) = cli.members {
        config.cluster.members = members;
    }
    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::from(2);
    }

    let system = System::new();
    match system.block_on(run(pet, config, cli.owners, cli.unelected, cli.publications)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{} failure: {}", e.class(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(
    pet: Pet,
    config: Config,
    owners: u32,
    unelected: bool,
    publications: Option<u64>,
) -> Result<(), CpError> {
    let cluster = ClusterRunner::start(&config.cluster, |_| CpStateMachine::default());
    let names = PrimitiveNames::default();
    let (stop, shutdown) = ShutdownSignal::channel();

    let mut watcher_config = config.client.clone();
    watcher_config.instance_name = format!("{}-watcher", pet.emoji());
    let watcher = PhotoWatcher::new(&CpClient::connect(cluster.clone(), watcher_config).await?, &names);
    let watching = actix::spawn(watch(watcher, shutdown.clone()));

    let mut running = vec![];
    for n in 0..owners {
        let mut client_config = config.client.clone();
        client_config.instance_name = format!("{}{}", pet.emoji(), n);
        let client = CpClient::connect(cluster.clone(), client_config).await?;
        let mut owner = PetOwner::new(client, pet, &names, config.owner.clone());
        if let Some(publications) = publications {
            owner = owner.with_max_publications(publications);
        }
        if unelected {
            owner = owner.unelected();
        }
        let mut shutdown = shutdown.clone();
        running.push(actix::spawn(async move { owner.supervise(&mut shutdown).await }));
    }

    let mut res = Ok(());
    for finished in join_all(running).await {
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => res = Err(e),
            Err(e) => warn!("owner task ended abnormally: {}", e),
        }
    }
    let _ = stop.send(true);
    if watching.await.is_err() {
        warn!("watcher task ended abnormally");
    }
    info!("all owners are done");
    res
}

async fn watch(mut watcher: PhotoWatcher, mut shutdown: ShutdownSignal) {
    while !shutdown.is_shutdown() {
        tokio::select! {
            photo = watcher.next_photo(Duration::from_secs(5)) => match photo {
                Ok(Some(photo)) => info!("watcher; received {}", photo),
                Ok(None) => {}
                Err(e) => warn!("watcher; {}", e),
            },
            _ = shutdown.wait() => {}
        }
    }
}
