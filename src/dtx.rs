//! Committed transaction table of a container.
//!
//! Only the part the collector needs lives here: once a container is being reclaimed its
//! transaction records are dead and the table is destroyed before anything else is drained.
use tracing::debug;

use crate::{
    error::Result,
    layout::{DtxTable, Record},
    umem::{Umem, UmemOff},
};

/// Allocates an empty table for the container at `cont`.
pub fn create_table(umem: &mut Umem, cont: UmemOff) -> Result<()> {
    let table = umem.alloc(Record::DtxTable(DtxTable::default()))?;
    umem.tx_add(cont)?;
    umem.cont_df_mut(cont).dtx_table = table;
    Ok(())
}

/// Records a committed transaction in the container's table.
pub fn commit(umem: &mut Umem, cont: UmemOff) -> Result<()> {
    let table = umem.cont_df(cont).dtx_table;
    umem.tx_add(table)?;
    match umem.record_mut(table) {
        Record::DtxTable(table) => table.committed += 1,
        _ => panic!("{} is not a transaction table", table),
    }
    Ok(())
}

/// Releases the table of the container at `cont`. Destroying an already destroyed table is a
/// no-op.
pub fn destroy_table(umem: &mut Umem, cont: UmemOff) -> Result<()> {
    let table = umem.cont_df(cont).dtx_table;
    if table.is_null() {
        return Ok(());
    }
    umem.free(table)?;
    umem.tx_add(cont)?;
    umem.cont_df_mut(cont).dtx_table = UmemOff::NULL;
    debug!(cont = %cont, "destroyed transaction table");
    Ok(())
}
