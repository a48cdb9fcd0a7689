//! Start-up and supervision of every witness task.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Result, anyhow, bail};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::{
    attestation::AttestationPipeline,
    cfg::{ChainConfig, Config},
    chain::{
        ChainProvider, ChainSide, Chains, SignerMembership,
        remote::{AdapterSettings, RemoteChainProvider},
    },
    creation::{BridgeCreator, CreationSettings, HttpSequencer, Sequencer, run_creation},
    discovery::{discover, run_discovery},
    listener::Listener,
    metrics::Metrics,
    sender::{GasCeilings, Sender, SenderHandle, create_account::CreateAccountSequencer},
    state::AttestationState,
};

const SEQUENCER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WitnessNode {
    config: Config,
    chains: Chains,
    state: Arc<AttestationState>,
    metrics: Metrics,
    sequencer: Option<Arc<dyn Sequencer>>,
}

async fn connect_chain(chain: &ChainConfig) -> Result<Arc<dyn ChainProvider>> {
    let provider = RemoteChainProvider::connect(
        chain.chain_type,
        &chain.node,
        chain.starting_block,
        &AdapterSettings {
            door_address: chain.door_address.clone(),
            signer: &chain.signer,
        },
    )
    .await?;
    Ok(Arc::new(provider))
}

impl WitnessNode {
    /// Connect to both chain adapters and prepare the node.
    pub async fn connect(config: Config) -> Result<WitnessNode> {
        let main = connect_chain(&config.main_chain).await?;
        let side = connect_chain(&config.side_chain).await?;
        let sequencer: Option<Arc<dyn Sequencer>> = if config.server.dynamic_bridge_creation {
            Some(Arc::new(HttpSequencer::new(
                &config.server.sequencer_url,
                SEQUENCER_TIMEOUT,
            )?))
        } else {
            None
        };
        WitnessNode::new(config, Chains::new(main, side), sequencer, Metrics::default()).await
    }

    /// Pair the bridges both chains know about and restore attestation progress. Fails if the bridge registries are
    /// inconsistent or the saved state cannot be read.
    pub async fn new(
        config: Config,
        chains: Chains,
        sequencer: Option<Arc<dyn Sequencer>>,
        metrics: Metrics,
    ) -> Result<WitnessNode> {
        if !discover(&chains).await {
            bail!("bridge validation failed, refusing to start");
        }
        info!(
            main_bridges = chains.main.bridges().active_ids().len(),
            side_bridges = chains.side.bridges().active_ids().len(),
            "bridges validated"
        );

        let state = Arc::new(AttestationState::load(&config.server.state_file)?);
        seed_cursors(&chains, &state);

        Ok(WitnessNode {
            config,
            chains,
            state,
            metrics,
            sequencer,
        })
    }

    pub fn state(&self) -> &Arc<AttestationState> {
        &self.state
    }

    /// Spawn every task of the node into `tasks`.
    pub fn start(self, tasks: &mut JoinSet<Result<()>>) -> SenderHandle {
        let WitnessNode {
            config,
            chains,
            state,
            metrics,
            sequencer,
        } = self;
        let server = &config.server;

        let ceilings = GasCeilings::new([
            (chains.main.chain_id(), config.main_chain.max_gas_factor),
            (chains.side.chain_id(), config.side_chain.max_gas_factor),
        ]);
        let sender = Sender::new(state.clone(), ceilings, metrics.clone()).spawn(tasks);

        let membership = Arc::new(SignerMembership::new(
            chains.clone(),
            config.main_chain.signer_list_ttl(),
            config.side_chain.signer_list_ttl(),
        ));

        let (main_creates, main_sequencer) = CreateAccountSequencer::new(sender.clone());
        let (side_creates, side_sequencer) = CreateAccountSequencer::new(sender.clone());
        tasks.spawn(main_sequencer.run());
        tasks.spawn(side_sequencer.run());

        let (into_main, main_pipeline) = AttestationPipeline::new(
            ChainSide::Main,
            chains.clone(),
            membership.clone(),
            sender.clone(),
            main_creates,
            metrics.clone(),
        );
        let (into_side, side_pipeline) = AttestationPipeline::new(
            ChainSide::Side,
            chains.clone(),
            membership.clone(),
            sender.clone(),
            side_creates,
            metrics,
        );
        tasks.spawn(main_pipeline.run());
        tasks.spawn(side_pipeline.run());

        let listener = Arc::new(Listener::new(chains.clone(), into_side, into_main));
        tasks.spawn(listener.run(server.queue_period()));
        tasks.spawn(run_discovery(
            chains.clone(),
            server.bridge_listener_queue_period(),
        ));

        if let Some(sequencer) = sequencer {
            let creator = BridgeCreator::new(
                chains,
                membership,
                sequencer,
                CreationSettings {
                    main_door: config.main_chain.door_address.clone(),
                    side_door: config.side_chain.door_address.clone(),
                    min_signature_reward: server.min_bridge_signature_reward,
                    max_signature_reward: server.max_bridge_signature_reward,
                    max_tries: server.max_create_bridge_iterations,
                },
            );
            tasks.spawn(run_creation(
                Arc::new(creator),
                server.bridge_creation_queue_period(),
            ));
        }

        tasks.spawn(state.run_saver(server.state_save_period()));
        info!("witness started");
        sender
    }

    /// Run until `shutdown` completes or a task fails, then save the attestation state once. In-flight work is
    /// abandoned.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let state = self.state.clone();
        let mut tasks = JoinSet::new();
        self.start(&mut tasks);

        let result = tokio::select! {
            Some(result) = tasks.join_next() => match result {
                Ok(Ok(())) => Err(anyhow!("a witness task stopped unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            },
            () = shutdown => {
                info!("shutting down");
                Ok(())
            }
        };
        tasks.abort_all();

        match state.save() {
            Ok(()) => info!(path = %state.path().display(), "saved attestation state"),
            Err(e) => error!(path = %state.path().display(), "failed to save attestation state: {e:?}"),
        }
        result
    }
}

/// Resume scanning where attestation left off. Progress is recorded against the chain an attestation was sent to, so
/// each chain's cursor comes from the other chain's entry.
fn seed_cursors(chains: &Chains, state: &AttestationState) {
    for side in [ChainSide::Main, ChainSide::Side] {
        let source = chains.get(side);
        let destination = chains.get(side.other());
        if let Some(block) = state
            .last_attested_block(destination.chain_id())
            .filter(|block| *block > 0)
        {
            info!(chain_id = source.chain_id(), block, "resuming scan");
            source.set_current_block_number(block);
        }
    }
}
