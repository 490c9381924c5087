use crate::pool::PooledConnection;
use crate::transaction::UnitOfWork;

/// Where a procedure call runs.
///
/// A call through a unit of work always uses the connection bound to its active
/// transaction, never a separate connection.
pub enum ExecTarget<'a> {
    Connection(&'a mut PooledConnection),
    UnitOfWork(&'a mut UnitOfWork),
}

impl<'a> From<&'a mut PooledConnection> for ExecTarget<'a> {
    fn from(conn: &'a mut PooledConnection) -> Self {
        ExecTarget::Connection(conn)
    }
}

impl<'a> From<&'a mut UnitOfWork> for ExecTarget<'a> {
    fn from(uow: &'a mut UnitOfWork) -> Self {
        ExecTarget::UnitOfWork(uow)
    }
}
