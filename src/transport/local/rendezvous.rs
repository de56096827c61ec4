//! Collective rounds.
//!
//! Every rank deposits a `Contribution`. The last one to arrive resolves the round into one
//! `Outcome` per rank, and each rank picks up its own. A rank can deposit its next contribution
//! as soon as it has taken its outcome, because a round cannot complete before every rank has
//! taken part in it.

use std::mem;

use crate::datatype::WireTag;
use crate::transport::{
    builtin, Code, RawOp, UserFunction, ERR_COUNT, ERR_NOT_SAME, ERR_OP, SUCCESS,
};
use crate::Rank;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Kind {
    Barrier,
    Broadcast,
    Scatter,
    Gather,
    AllGather,
    Reduce,
    AllReduce,
    AllToAll,
}

#[derive(Debug)]
pub(super) struct Contribution {
    pub kind: Kind,
    pub root: Rank,
    pub datatype: WireTag,
    pub op: RawOp,
    /// Bytes sent by this rank
    pub data: Vec<u8>,
    /// Length of this rank's receive buffer, `0` if it has none
    pub capacity: usize,
    /// Argument error this rank found before arriving
    pub status: Code,
}

impl Contribution {
    pub fn new(kind: Kind, root: Rank, datatype: WireTag) -> Self {
        Contribution {
            kind,
            root,
            datatype,
            op: RawOp::NULL,
            data: Vec::new(),
            capacity: 0,
            status: SUCCESS,
        }
    }

    fn agrees_with(&self, other: &Contribution) -> bool {
        self.kind == other.kind
            && self.root == other.root
            && self.datatype == other.datatype
            && (self.op == other.op || (is_user(self.op) && is_user(other.op)))
    }
}

/// User handles are per rank, so they only have to agree on being user handles.
fn is_user(op: RawOp) -> bool {
    op.0 >= RawOp::FIRST_USER
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct Outcome {
    pub code: Code,
    /// Bytes for this rank's receive buffer, `None` if it receives nothing
    pub data: Option<Vec<u8>>,
}

impl Outcome {
    fn done() -> Self {
        Outcome {
            code: SUCCESS,
            data: None,
        }
    }

    fn received(data: Vec<u8>) -> Self {
        Outcome {
            code: SUCCESS,
            data: Some(data),
        }
    }

    fn failed(code: Code) -> Self {
        Outcome { code, data: None }
    }
}

/// How a reduction combines two contributions.
pub(super) enum Combiner {
    Builtin(RawOp),
    User {
        function: UserFunction,
        datatype: WireTag,
    },
    Invalid,
}

impl Combiner {
    pub fn check(&self, datatype: WireTag) -> Code {
        match self {
            Combiner::Builtin(op) if builtin::supports(*op, datatype) => SUCCESS,
            Combiner::User { datatype: d, .. } if *d == datatype => SUCCESS,
            _ => ERR_OP,
        }
    }

    /// `inoutbuf[i] = inbuf[i] ∘ inoutbuf[i]`
    pub fn combine(&self, datatype: WireTag, inbuf: &[u8], inoutbuf: &mut [u8]) -> Code {
        match self {
            Combiner::Builtin(op) => builtin::apply(*op, datatype, inbuf, inoutbuf),
            Combiner::User { .. } if inbuf.len() != inoutbuf.len() => ERR_COUNT,
            Combiner::User { function, datatype: d } if *d == datatype => {
                function(inbuf, inoutbuf, datatype);
                SUCCESS
            }
            _ => ERR_OP,
        }
    }
}

#[derive(Debug)]
pub(super) struct Rendezvous {
    contributions: Vec<Option<Contribution>>,
    outcomes: Vec<Option<Outcome>>,
    arrived: usize,
}

impl Rendezvous {
    pub fn new(size: usize) -> Self {
        Rendezvous {
            contributions: (0..size).map(|_| None).collect(),
            outcomes: (0..size).map(|_| None).collect(),
            arrived: 0,
        }
    }

    /// Deposit the contribution of `rank`. The last arrival receives the whole round.
    pub fn arrive(
        &mut self,
        rank: usize,
        contribution: Contribution,
    ) -> Option<Vec<Contribution>> {
        debug_assert!(self.contributions[rank].is_none());
        self.contributions[rank] = Some(contribution);
        self.arrived += 1;
        if self.arrived < self.contributions.len() {
            return None;
        }
        self.arrived = 0;
        let fresh = (0..self.contributions.len()).map(|_| None).collect();
        Some(
            mem::replace(&mut self.contributions, fresh)
                .into_iter()
                .flatten()
                .collect(),
        )
    }

    /// Make the outcomes of a resolved round available.
    pub fn publish(&mut self, outcomes: Vec<Outcome>) {
        for (slot, outcome) in self.outcomes.iter_mut().zip(outcomes) {
            *slot = Some(outcome);
        }
    }

    pub fn take(&mut self, rank: usize) -> Option<Outcome> {
        self.outcomes[rank].take()
    }
}

/// Compute what every rank receives from one round.
pub(super) fn resolve(contributions: &[Contribution], combiner: &Combiner) -> Vec<Outcome> {
    let size = contributions.len();
    let fail = |code: Code| (0..size).map(|_| Outcome::failed(code)).collect::<Vec<_>>();

    let first = &contributions[0];
    if contributions.iter().any(|c| !c.agrees_with(first)) {
        return fail(ERR_NOT_SAME);
    }
    if let Some(c) = contributions.iter().find(|c| c.status != SUCCESS) {
        return fail(c.status);
    }

    let root = usize::try_from(first.root).unwrap_or(0);
    let everyone = |f: &dyn Fn(usize) -> Outcome| (0..size).map(f).collect::<Vec<_>>();

    match first.kind {
        Kind::Barrier => everyone(&|_| Outcome::done()),
        Kind::Broadcast => {
            let payload = &contributions[root].data;
            if contributions.iter().any(|c| c.capacity != payload.len()) {
                return fail(ERR_COUNT);
            }
            everyone(&|_| Outcome::received(payload.clone()))
        }
        Kind::Scatter => {
            let block = first.capacity;
            if contributions.iter().any(|c| c.capacity != block)
                || contributions[root].data.len() != block * size
            {
                return fail(ERR_COUNT);
            }
            let payload = &contributions[root].data;
            everyone(&|r| Outcome::received(payload[r * block..(r + 1) * block].to_vec()))
        }
        Kind::Gather | Kind::AllGather => {
            let block = first.data.len();
            let short_receiver = match first.kind {
                Kind::Gather => contributions[root].capacity != block * size,
                _ => contributions.iter().any(|c| c.capacity != block * size),
            };
            if short_receiver || contributions.iter().any(|c| c.data.len() != block) {
                return fail(ERR_COUNT);
            }
            let joined = contributions
                .iter()
                .flat_map(|c| c.data.iter().copied())
                .collect::<Vec<_>>();
            match first.kind {
                Kind::Gather => everyone(&|r| {
                    if r == root {
                        Outcome::received(joined.clone())
                    } else {
                        Outcome::done()
                    }
                }),
                _ => everyone(&|_| Outcome::received(joined.clone())),
            }
        }
        Kind::Reduce | Kind::AllReduce => {
            let len = first.data.len();
            let short_receiver = match first.kind {
                Kind::Reduce => contributions[root].capacity != len,
                _ => contributions.iter().any(|c| c.capacity != len),
            };
            if short_receiver || contributions.iter().any(|c| c.data.len() != len) {
                return fail(ERR_COUNT);
            }
            let code = combiner.check(first.datatype);
            if code != SUCCESS {
                return fail(code);
            }
            // v0 ∘ (v1 ∘ (… ∘ v(n-1)))
            let mut accumulator = contributions[size - 1].data.clone();
            for c in contributions[..size - 1].iter().rev() {
                let code = combiner.combine(first.datatype, &c.data, &mut accumulator);
                if code != SUCCESS {
                    return fail(code);
                }
            }
            match first.kind {
                Kind::Reduce => everyone(&|r| {
                    if r == root {
                        Outcome::received(accumulator.clone())
                    } else {
                        Outcome::done()
                    }
                }),
                _ => everyone(&|_| Outcome::received(accumulator.clone())),
            }
        }
        Kind::AllToAll => {
            let len = first.data.len();
            if contributions
                .iter()
                .any(|c| c.data.len() != len || c.capacity != len)
                || len % (size * first.datatype.size()) != 0
            {
                return fail(ERR_COUNT);
            }
            let block = len / size;
            everyone(&|j| {
                Outcome::received(
                    contributions
                        .iter()
                        .flat_map(|c| c.data[j * block..(j + 1) * block].iter().copied())
                        .collect(),
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ERR_ROOT;
    use std::sync::Arc;

    fn contribution(kind: Kind, data: &[u8], capacity: usize) -> Contribution {
        Contribution {
            data: data.to_vec(),
            capacity,
            ..Contribution::new(kind, 0, WireTag::UInt8)
        }
    }

    #[test]
    fn broadcast_copies_root() {
        let round = [
            contribution(Kind::Broadcast, &[1, 2], 2),
            contribution(Kind::Broadcast, &[], 2),
        ];
        let outcomes = resolve(&round, &Combiner::Invalid);
        assert_eq!(outcomes, vec![Outcome::received(vec![1, 2]); 2]);
    }

    #[test]
    fn user_handles_agree_across_ranks() {
        let mut a = contribution(Kind::AllReduce, &[1], 1);
        let mut b = contribution(Kind::AllReduce, &[2], 1);
        a.op = RawOp(RawOp::FIRST_USER);
        b.op = RawOp(RawOp::FIRST_USER + 1);
        assert!(a.agrees_with(&b));
        b.op = RawOp::SUM;
        assert!(!a.agrees_with(&b));
    }

    #[test]
    fn mixed_kinds_are_not_the_same() {
        let round = [
            contribution(Kind::Barrier, &[], 0),
            contribution(Kind::Broadcast, &[], 0),
        ];
        for outcome in resolve(&round, &Combiner::Invalid) {
            assert_eq!(outcome.code, ERR_NOT_SAME);
        }
    }

    #[test]
    fn local_argument_errors_reach_everyone() {
        let mut bad = contribution(Kind::Barrier, &[], 0);
        bad.status = ERR_ROOT;
        let round = [contribution(Kind::Barrier, &[], 0), bad];
        for outcome in resolve(&round, &Combiner::Invalid) {
            assert_eq!(outcome.code, ERR_ROOT);
        }
    }

    #[test]
    fn scatter_splits_by_rank() {
        let round = [
            contribution(Kind::Scatter, &[1, 2, 3, 4, 5, 6], 2),
            contribution(Kind::Scatter, &[], 2),
            contribution(Kind::Scatter, &[], 2),
        ];
        let outcomes = resolve(&round, &Combiner::Invalid);
        assert_eq!(outcomes[2], Outcome::received(vec![5, 6]));
    }

    #[test]
    fn gather_fills_only_root() {
        let round = [
            contribution(Kind::Gather, &[0], 2),
            contribution(Kind::Gather, &[1], 0),
        ];
        let outcomes = resolve(&round, &Combiner::Invalid);
        assert_eq!(outcomes[0], Outcome::received(vec![0, 1]));
        assert_eq!(outcomes[1], Outcome::done());
    }

    #[test]
    fn short_receive_buffer_is_a_count_error() {
        let round = [
            contribution(Kind::AllGather, &[0], 2),
            contribution(Kind::AllGather, &[1], 1),
        ];
        for outcome in resolve(&round, &Combiner::Invalid) {
            assert_eq!(outcome.code, ERR_COUNT);
        }
    }

    #[test]
    fn reduction_folds_from_the_right() {
        // a ∘ b = 2a + b over u8 exposes the bracketing: 1 ∘ (2 ∘ 3) = 2 + (4 + 3) = 9
        let combiner = Combiner::User {
            function: Arc::new(|a: &[u8], b: &mut [u8], _: WireTag| {
                for (x, y) in a.iter().zip(b.iter_mut()) {
                    *y = 2 * x + *y;
                }
            }),
            datatype: WireTag::UInt8,
        };
        let round = [
            contribution(Kind::AllReduce, &[1], 1),
            contribution(Kind::AllReduce, &[2], 1),
            contribution(Kind::AllReduce, &[3], 1),
        ];
        for outcome in resolve(&round, &combiner) {
            assert_eq!(outcome, Outcome::received(vec![9]));
        }
    }

    #[test]
    fn reduction_checks_operator_type() {
        let round = [contribution(Kind::AllReduce, &[1], 1)];
        let combiner = Combiner::User {
            function: Arc::new(|_: &[u8], _: &mut [u8], _: WireTag| {}),
            datatype: WireTag::Int32,
        };
        assert_eq!(resolve(&round, &combiner)[0].code, ERR_OP);
    }

    #[test]
    fn all_to_all_transposes_blocks() {
        let round = [
            contribution(Kind::AllToAll, &[0, 1], 2),
            contribution(Kind::AllToAll, &[10, 11], 2),
        ];
        let outcomes = resolve(&round, &Combiner::Invalid);
        assert_eq!(outcomes[0], Outcome::received(vec![0, 10]));
        assert_eq!(outcomes[1], Outcome::received(vec![1, 11]));
    }

    #[test]
    fn rounds_complete_on_last_arrival() {
        let mut rendezvous = Rendezvous::new(2);
        assert!(rendezvous
            .arrive(1, contribution(Kind::Barrier, &[], 0))
            .is_none());
        let round = rendezvous
            .arrive(0, contribution(Kind::Barrier, &[], 0))
            .unwrap();
        assert_eq!(round.len(), 2);
        rendezvous.publish(resolve(&round, &Combiner::Invalid));
        assert_eq!(rendezvous.take(0), Some(Outcome::done()));
        assert_eq!(rendezvous.take(0), None);
    }
}
