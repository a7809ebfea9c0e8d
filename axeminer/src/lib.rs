// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Mining pipeline core: stratum V1 client, job construction, BM13xx hash
//! chain driver and the orchestration fabric between them.

pub mod bm13xx;
pub mod client;
pub mod config;
pub mod error;
pub mod hash_chain;
pub mod hub;
pub mod io;
pub mod job;
pub mod registry;
pub mod stats;

#[cfg(test)]
pub mod test_utils;

use axe_logging::macros::*;

use tokio::sync::mpsc;

use error::Error;

use std::sync::Arc;

/// Bring the hash chain up and run the four pipeline tasks until the
/// client shuts down or a task dies
pub async fn run(store: Arc<config::Store>) -> error::Result<()> {
    let settings = store.settings();
    if settings.overheat_mode != 0 {
        return Err(Error::Config(
            "overheat mode is latched; clear it before mining".to_string(),
        ));
    }
    let model = settings.model()?;
    let frequency_mhz = settings.frequency_mhz()?;

    info!(
        "Starting miner: {} chain on {}, {:.2} MHz",
        model.name(),
        settings.asic_serial,
        frequency_mhz
    );

    let device = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&settings.asic_serial)
        .await?;
    let (frame_tx, frame_rx) = io::split(device);
    let mut chain = hash_chain::HashChain::new(
        frame_rx,
        frame_tx,
        io::NullControl,
        model,
        settings.asic_count,
        axe_bitcoin::BIP320_VERSION_MASK,
    );
    chain.init(frequency_mhz).await?;
    let asic_difficulty = chain.asic_difficulty();
    let (job_sender, result_receiver) = chain.split();

    let core = hub::CoreHandle::new();
    let meter = stats::Meter::new();

    let (notify_tx, notify_rx) = mpsc::channel(hub::NOTIFY_QUEUE_DEPTH);
    let (job_tx, job_rx) = mpsc::channel(hub::JOB_QUEUE_DEPTH);
    let (share_tx, share_rx) = mpsc::channel(hub::SHARE_QUEUE_DEPTH);

    let client = client::Client::new(
        core.clone(),
        client::endpoints_from_settings(&settings),
        client::user_agent(model),
        settings.suggest_difficulty,
        notify_tx,
        share_rx,
        meter.clone(),
    );
    let builder = job::Builder::new(
        model.hardware_version_rolling(),
        model.midstate_count(),
        settings.nonce_subrange,
    );
    let receiver_state = hub::ReceiverState::new(asic_difficulty, store.clone());

    let client_task = tokio::spawn(client.run());
    let creator_task = tokio::spawn(hub::job_creator_task(
        core.clone(),
        notify_rx,
        job_tx,
        builder,
        model.job_interval(),
    ));
    let sender_task = tokio::spawn(hub::asic_sender_task(core.clone(), job_rx, job_sender));
    let receiver_task = tokio::spawn(hub::asic_receiver_task(
        core.clone(),
        result_receiver,
        share_tx,
        receiver_state,
    ));
    tokio::spawn(stats::hashrate_meter_task(meter));

    // the pipeline lives as long as all of its tasks; the client decides
    // whether its exit is fatal
    tokio::select! {
        result = client_task => match result {
            Ok(Ok(())) => {
                info!("stratum client finished, stopping the pipeline");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::General(format!("stratum client task died: {}", e))),
        },
        _ = creator_task => Err(Error::General("job creator exited unexpectedly".to_string())),
        _ = sender_task => Err(Error::General("asic sender exited unexpectedly".to_string())),
        _ = receiver_task => Err(Error::General("asic receiver exited unexpectedly".to_string())),
    }
}
