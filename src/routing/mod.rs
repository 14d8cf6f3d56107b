mod bucket;
mod peer;
mod table;

pub(crate) use self::{
    peer::Peer,
    table::{sort_by_distance, RoutingTable},
};
