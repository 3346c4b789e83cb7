use log::info;

use crate::config::Config;
use crate::error::Result;
use crate::rdma::gid::Gid;
use crate::resources::Resources;

/// Barrier tag exchanged once both QPs are in RTS.
pub const CONNECTED_TAG: u8 = b'Q';

/// Connect the local QP with the peer's.
///
/// Exchanges connection metadata over the TCP channel, checks the peer's,
/// drives the QP through INIT, RTR and RTS, and finally waits for the peer
/// to get there too.
pub fn connect(res: &mut Resources, cfg: &Config) -> Result<()> {
    let gid = match cfg.gid_idx {
        Some(index) => res.context().query_gid(index)?,
        None => Gid::ZERO,
    };
    let local = res.local_meta(gid);
    let remote = res.channel_mut().exchange(&local)?;

    info!("Remote address = {:#x}", remote.addr);
    info!("Remote rkey = {:#x}", remote.rkey);
    info!("Remote QP number = {:#x}", remote.qp_num);
    info!("Remote LID = {:#x}", remote.lid);
    if cfg.gid_idx.is_some() {
        info!("Remote GID = {}", remote.gid);
    }

    remote.validate(cfg.gid_idx.is_some())?;
    res.set_remote(remote);

    let qp = res.qp_mut();
    qp.modify_reset2init(cfg.ib_port)?;
    qp.modify_init2rtr(&remote.peer(), cfg.ib_port, cfg.gid_idx)?;
    qp.modify_rtr2rts()?;
    info!("QP {:#x} successfully connected", qp.qp_num());

    res.channel_mut().barrier(CONNECTED_TAG)?;
    Ok(())
}
