//! Property tests over small random allocation instances.

use proptest::prelude::*;
use rbc_matching::blood::{Antigen, BloodProfile, MajorGroup};
use rbc_matching::config::{MatchingConfig, Weight, WeightStrategy, RELATIVE_IMMUNOGENICITY};
use rbc_matching::inventory::{InventoryUnit, PatientGroup, Request, RequestId, UnitId};
use rbc_matching::model::{AllocationModel, AllocationProgram, Formulation, ProgramOptions, EPS};
use rbc_matching::solver::{AllocationSolver, AnnealingSolver, ExactSolver, SolverConfig, SolverStatus};
use std::cmp::Ordering;
use std::collections::HashSet;

const MINOR_POOL: [Antigen; 6] = [Antigen::C, Antigen::E, Antigen::LowerC, Antigen::K, Antigen::Fya, Antigen::Jka];

fn profile() -> impl Strategy<Value = BloodProfile> {
    (0usize..8, prop::collection::vec(any::<bool>(), MINOR_POOL.len())).prop_map(|(g, bits)| {
        let minor: Vec<Antigen> = MINOR_POOL
            .iter()
            .zip(bits)
            .filter(|(_, on)| *on)
            .map(|(a, _)| *a)
            .collect();
        BloodProfile::with_group(MajorGroup::ALL[g], &minor)
    })
}

fn units() -> impl Strategy<Value = Vec<InventoryUnit>> {
    prop::collection::vec((profile(), 0u32..35), 0..6).prop_map(|v| {
        v.into_iter()
            .enumerate()
            .map(|(i, (p, age))| InventoryUnit::new(UnitId(i as u64), p, age))
            .collect()
    })
}

fn requests() -> impl Strategy<Value = Vec<Request>> {
    prop::collection::vec((profile(), 1u32..3, 0u32..3, 0usize..7), 1..4).prop_map(|v| {
        v.into_iter()
            .enumerate()
            .map(|(i, (p, n, issuing, g))| {
                Request::new(RequestId(i as u64), p, n, 0, issuing, PatientGroup::ALL[g]).unwrap()
            })
            .collect()
    })
}

fn due_today_shortages(model: &AllocationModel, units: &[InventoryUnit], requests: &[Request]) -> usize {
    model.solve(units, requests, 0).shortages().filter(|o| o.today).count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_stricter_mandatory_set_never_reduces_shortages(
        units in units(),
        profiles in prop::collection::vec((profile(), 1u32..3), 1..4),
    ) {
        let requests: Vec<Request> = profiles
            .into_iter()
            .enumerate()
            .map(|(i, (p, n))| Request::new(RequestId(i as u64), p, n, 0, 0, PatientGroup::Other).unwrap())
            .collect();

        let base = RELATIVE_IMMUNOGENICITY.to_vec();
        let mut strict = base.clone();
        for a in [Antigen::K, Antigen::E, Antigen::LowerC] {
            strict[a.index()] = Weight::Mandatory;
        }
        let loose = AllocationModel::new(
            &MatchingConfig::default().with_weights(WeightStrategy::RelativeImmunogenicity(base)),
        ).unwrap();
        let tight = AllocationModel::new(
            &MatchingConfig::default().with_weights(WeightStrategy::RelativeImmunogenicity(strict)),
        ).unwrap();

        prop_assert!(due_today_shortages(&tight, &units, &requests) >= due_today_shortages(&loose, &units, &requests));
    }

    #[test]
    fn prop_assignment_is_single_issue_compatible_and_exact(units in units(), requests in requests()) {
        let config = MatchingConfig::default();
        let f = Formulation::from_config(&config).unwrap();
        let a = AllocationModel::new(&config).unwrap().solve(&units, &requests, 0);
        prop_assert_eq!(a.status, SolverStatus::Optimal);

        let mut used = HashSet::new();
        for (o, r) in a.outcomes.iter().zip(&requests) {
            prop_assert_eq!(o.units.len() as u32, if o.served { r.num_units } else { 0 });
            for id in &o.units {
                prop_assert!(used.insert(*id));
                let unit = units.iter().find(|u| u.id == *id).unwrap();
                prop_assert!(f.engine.is_compatible(unit.profile.mask(), r));
                prop_assert!(f.engine.is_time_feasible(unit, r, 0));
            }
        }
    }

    #[test]
    fn prop_annealing_never_beats_exact_optimum(units in units(), requests in requests()) {
        let f = Formulation::from_config(&MatchingConfig::default()).unwrap();
        let program = AllocationProgram::build(&f, &units, &requests, ProgramOptions::online(0));
        let config = SolverConfig::default().with_anneal_iterations(2_000);

        let exact = ExactSolver.solve(&program, &config);
        let anneal = AnnealingSolver.solve(&program, &config);
        prop_assert_eq!(exact.status, SolverStatus::Optimal);

        let best = program.evaluate(&exact.pool[0]).unwrap().tiers();
        let found = program.evaluate(&anneal.pool[0]).unwrap().tiers();
        prop_assert_ne!(program.objective.compare(found, best, EPS), Ordering::Less);
    }

    #[test]
    fn prop_linear_export_agrees_with_evaluation(units in units(), requests in requests()) {
        let f = Formulation::from_config(&MatchingConfig::default()).unwrap();
        let program = AllocationProgram::build(&f, &units, &requests, ProgramOptions::online(0));
        let outcome = ExactSolver.solve(&program, &SolverConfig::default());
        let sel = &outcome.pool[0];

        let linear = program.linear();
        prop_assert!(linear.validate().is_ok());
        prop_assert!(linear.is_satisfied_by(&program.full_assignment(sel)));
    }
}
