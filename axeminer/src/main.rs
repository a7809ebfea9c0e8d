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

use axe_logging::macros::*;

use axeminer::config;

use std::sync::Arc;

#[tokio::main]
async fn main() {
    let app = config::Settings::add_args(
        clap::App::new("axeminer")
            .version(clap::crate_version!())
            .about("Mining pipeline core for BM13xx hash chains"),
    );
    let matches = app.get_matches();

    let config_path = matches
        .value_of("config")
        .unwrap_or(config::DEFAULT_CONFIG_PATH);
    let store = match config::Store::load(config_path) {
        Ok(store) => store,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = store.apply(|settings| settings.apply_args(&matches)) {
        error!("{}", e);
        std::process::exit(1);
    }

    if let Err(e) = axeminer::run(Arc::new(store)).await {
        error!("miner stopped: {}", e);
        std::process::exit(1);
    }
}
