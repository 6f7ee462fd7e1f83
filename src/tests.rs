use crate::aggregator::Aggregator;
use crate::brackets::BracketData;
use crate::coevolve::Coevolve;
use crate::ensemble::{mean_at_saves, run_ensemble};
use crate::rates::{JumpSystem, MassActionJump, VariableRateJump};
use crate::rssacr::RssaCr;
use crate::spatial::{CartesianGrid, RssaCrDirect, SpatialSystem};
use crate::stepper::{
    InterventionAction, InterventionEvent, InterventionPlan, Retcode, SsaIntegrator, SsaStepper,
};
use crate::SimError;

/// Birth-death-immigration chain: X -> 2X at rate X, X -> 0 at rate 2X,
/// 0 -> X at rate 50. Stationary mean is 50.
fn birth_death_system() -> JumpSystem {
    let ma = MassActionJump::new(
        vec![1.0, 2.0, 50.0],
        vec![vec![(0, 1)], vec![(0, 1)], vec![]],
        vec![vec![(0, 1)], vec![(0, -1)], vec![(0, 1)]],
    )
    .unwrap();
    JumpSystem::pure_mass_action(ma)
}

fn saveat_range(from: f64, to: f64, step: f64) -> Vec<f64> {
    let mut times = Vec::new();
    let mut t = from;
    while t <= to + 1e-9 {
        times.push(t);
        t += step;
    }
    times
}

fn time_average(sol: &crate::stepper::Solution, species: usize) -> f64 {
    let total: f64 = sol.u.iter().map(|u| u[species] as f64).sum();
    total / sol.u.len() as f64
}

#[test]
fn rssacr_birth_death_matches_stationary_mean() {
    let saveat = saveat_range(1000.0, 2000.0, 2.0);
    let agg = RssaCr::new(
        birth_death_system(),
        &[5],
        &[],
        BracketData::default(),
        2000.0,
        901,
    )
    .unwrap();
    let stepper = SsaStepper::new(Aggregator::from(agg), vec![5], vec![], (0.0, 2000.0))
        .unwrap()
        .saveat(saveat)
        .unwrap();
    let sol = stepper.solve().unwrap();
    assert_eq!(sol.retcode, Retcode::Success);

    let mean = time_average(&sol, 0);
    assert!(
        (mean - 50.0).abs() < 5.0,
        "time-average occupancy {} far from 50",
        mean
    );
    // the chain must not stall at large t
    let tail: Vec<i32> = sol.u[sol.len() - 10..].iter().map(|u| u[0]).collect();
    assert!(tail.iter().any(|&v| v != tail[0]));
}

#[test]
fn coevolve_birth_death_matches_stationary_mean() {
    let agg = Coevolve::new(birth_death_system(), 1, 600.0, 77).unwrap();
    let stepper = SsaStepper::new(Aggregator::from(agg), vec![5], vec![], (0.0, 600.0))
        .unwrap()
        .saveat(saveat_range(300.0, 600.0, 2.0))
        .unwrap();
    let sol = stepper.solve().unwrap();
    let mean = time_average(&sol, 0);
    assert!(
        (mean - 50.0).abs() < 5.0,
        "time-average occupancy {} far from 50",
        mean
    );
}

#[test]
fn rssacr_brackets_hold_through_a_run() {
    let mut agg = RssaCr::new(
        birth_death_system(),
        &[5],
        &[],
        BracketData::default(),
        1e6,
        11,
    )
    .unwrap();
    let mut integ = SsaIntegrator::new(vec![5], vec![], 0.0);
    agg.initialize(&mut integ).unwrap();
    for _ in 0..500 {
        if !integ.tstop.is_finite() {
            break;
        }
        integ.t = integ.tstop;
        agg.execute_jumps(&mut integ).unwrap();
        let brackets = agg.brackets();
        for (s, &n) in integ.u.iter().enumerate() {
            assert!(
                brackets.ulow[s] <= n && n <= brackets.uhigh[s],
                "species {} count {} escaped [{}, {}]",
                s,
                n,
                brackets.ulow[s],
                brackets.uhigh[s]
            );
        }
        for k in 0..3 {
            let rate = agg.exact_rate(&integ, k).unwrap();
            let (lo, hi) = agg.envelope_of(k);
            assert!(
                lo - 1e-9 <= rate && rate <= hi + 1e-9,
                "jump {} rate {} escaped [{}, {}]",
                k,
                rate,
                lo,
                hi
            );
        }
        agg.generate_jumps(&mut integ).unwrap();
    }
}

/// Two-species system with a seasonal variable-rate jump: N1 grows as a
/// unit-rate Poisson process; N2 grows at 1+sin(t) while N1 is even and
/// 1+cos(t) while it is odd, bounded above by 2.
fn seasonal_system() -> JumpSystem {
    let ma = MassActionJump::new(vec![1.0], vec![vec![]], vec![vec![(0, 1)]]).unwrap();
    let mut sys = JumpSystem::pure_mass_action(ma);
    sys.variable_jumps.push(VariableRateJump {
        rate: Box::new(|u, _, t| {
            if u[0] % 2 == 0 {
                1.0 + t.sin()
            } else {
                1.0 + t.cos()
            }
        }),
        urate: Box::new(|_, _, _| 2.0),
        lrate: None,
        rate_interval: None,
        affect: Box::new(|integ| integ.u[1] += 1),
    });
    sys.rate_reads = vec![vec![0]];
    sys.rate_writes = vec![vec![1]];
    sys
}

#[test]
fn seasonal_trajectories_are_monotone_counting_processes() {
    let agg = Coevolve::new(seasonal_system(), 2, 10.0, 5).unwrap();
    let stepper =
        SsaStepper::new(Aggregator::from(agg), vec![0, 0], vec![], (0.0, 10.0)).unwrap();
    let sol = stepper.solve().unwrap();
    assert!(sol.len() > 2);
    for pair in sol.u.windows(2) {
        assert!(pair[1][0] >= pair[0][0]);
        assert!(pair[1][1] >= pair[0][1]);
    }
}

#[test]
fn seasonal_mean_matches_integrated_rate() {
    let sols = run_ensemble(200, Some(2), Some(1234), |seed| {
        let agg = Coevolve::new(seasonal_system(), 2, 10.0, seed)?;
        SsaStepper::new(Aggregator::from(agg), vec![0, 0], vec![], (0.0, 10.0))?
            .saveat(vec![10.0])
    })
    .unwrap();
    let means = mean_at_saves(&sols).unwrap();
    // the integrated seasonal rate over [0, 10] is close to 10.65 under
    // even/odd parity balance
    let n2 = means[0][1];
    assert!(
        (9.5..=11.5).contains(&n2),
        "mean N2(10) = {} outside the integrated-rate band",
        n2
    );
    let n1 = means[0][0];
    assert!((9.0..=11.0).contains(&n1), "mean N1(10) = {}", n1);
}

/// First fire time of a rate-2t jump with windowed bounds; survival
/// function exp(-t^2), mean sqrt(pi)/2.
fn quadratic_hazard_system() -> JumpSystem {
    let mut sys = JumpSystem::pure_mass_action(MassActionJump::empty());
    sys.variable_jumps.push(VariableRateJump {
        rate: Box::new(|_, _, t| 2.0 * t),
        urate: Box::new(|_, _, t| 2.0 * (t + 1.0)),
        lrate: None,
        rate_interval: Some(Box::new(|_, _, _| 1.0)),
        affect: Box::new(|integ| integ.u[0] += 1),
    });
    sys.rate_reads = vec![vec![]];
    sys.rate_writes = vec![vec![0]];
    sys
}

#[test]
fn thinning_reproduces_the_nonhomogeneous_fire_time_distribution() {
    let n = 2000;
    let mut total = 0.0;
    for seed in 0..n {
        let mut agg = Coevolve::new(quadratic_hazard_system(), 1, 50.0, seed).unwrap();
        let mut integ = SsaIntegrator::new(vec![0], vec![], 0.0);
        agg.initialize(&mut integ).unwrap();
        assert!(integ.tstop.is_finite());
        total += integ.tstop;
    }
    let mean = total / n as f64;
    // sqrt(pi)/2 = 0.8862
    assert!(
        (0.84..=0.93).contains(&mean),
        "mean first fire time {} far from sqrt(pi)/2",
        mean
    );
}

#[test]
fn lrate_short_circuit_preserves_the_distribution() {
    // rate identically 1 with a loose bound of 2 and a tight lower bound:
    // every candidate accepts through the cheap branch, and the fire time
    // must still be Exp(1)
    let build = |seed: u64| {
        let mut sys = JumpSystem::pure_mass_action(MassActionJump::empty());
        sys.variable_jumps.push(VariableRateJump {
            rate: Box::new(|_, _, _| 1.0),
            urate: Box::new(|_, _, _| 2.0),
            lrate: Some(Box::new(|_, _, _| 1.0)),
            rate_interval: None,
            affect: Box::new(|integ| integ.u[0] += 1),
        });
        sys.rate_reads = vec![vec![]];
        sys.rate_writes = vec![vec![0]];
        Coevolve::new(sys, 1, 1e6, seed).unwrap()
    };
    let n = 2000;
    let mut total = 0.0;
    for seed in 0..n {
        let mut agg = build(seed);
        let mut integ = SsaIntegrator::new(vec![0], vec![], 0.0);
        agg.initialize(&mut integ).unwrap();
        total += integ.tstop;
    }
    let mean = total / n as f64;
    assert!(
        (0.91..=1.09).contains(&mean),
        "mean fire time {} far from 1",
        mean
    );
}

#[test]
fn inverted_rate_bounds_are_fatal() {
    let mut sys = JumpSystem::pure_mass_action(MassActionJump::empty());
    sys.variable_jumps.push(VariableRateJump {
        rate: Box::new(|_, _, _| 1.0),
        urate: Box::new(|_, _, _| 1.0),
        lrate: Some(Box::new(|_, _, _| 3.0)),
        rate_interval: None,
        affect: Box::new(|_| {}),
    });
    sys.rate_reads = vec![vec![]];
    sys.rate_writes = vec![vec![0]];
    let mut agg = Coevolve::new(sys, 1, 10.0, 21).unwrap();
    let mut integ = SsaIntegrator::new(vec![0], vec![], 0.0);
    let err = agg.initialize(&mut integ).unwrap_err();
    assert!(matches!(err, SimError::RateBound(_)));
}

#[test]
fn nan_rates_are_fatal() {
    let ma = MassActionJump::new(vec![1.0], vec![vec![]], vec![vec![(0, 1)]]).unwrap();
    let mut sys = JumpSystem::pure_mass_action(ma);
    sys.constant_jumps.push(crate::rates::ConstantRateJump {
        rate: Box::new(|_, _, _| f64::NAN),
        affect: Box::new(|_| {}),
    });
    sys.rate_reads = vec![vec![0]];
    sys.rate_writes = vec![vec![0]];
    let mut agg = Coevolve::new(sys, 1, 10.0, 2).unwrap();
    let mut integ = SsaIntegrator::new(vec![0], vec![], 0.0);
    let err = agg.initialize(&mut integ).unwrap_err();
    assert!(matches!(err, SimError::Domain(_)));
}

#[test]
fn firing_a_jump_leaves_independent_schedules_untouched() {
    // two non-interacting growth processes: the dependency graph must
    // localize every update to the fired jump itself
    let ma = MassActionJump::new(
        vec![1.0, 1.0],
        vec![vec![(0, 1)], vec![(1, 1)]],
        vec![vec![(0, 1)], vec![(1, 1)]],
    )
    .unwrap();
    let sys = JumpSystem::pure_mass_action(ma);
    let mut agg = Coevolve::new(sys, 2, 100.0, 9).unwrap();
    let mut integ = SsaIntegrator::new(vec![3, 3], vec![], 0.0);
    agg.initialize(&mut integ).unwrap();

    let fired = agg.next_jump;
    let other = 1 - fired;
    let other_time = agg.scheduled_time(other);
    let other_bound = agg.current_bound(other);

    integ.t = integ.tstop;
    agg.execute_jumps(&mut integ).unwrap();
    assert_eq!(agg.scheduled_time(other), other_time);
    assert_eq!(agg.current_bound(other), other_bound);
    assert_ne!(agg.scheduled_time(fired), integ.t);
}

#[test]
fn interventions_can_modify_species_without_reactions() {
    let sys = JumpSystem::pure_mass_action(MassActionJump::empty());
    let agg = RssaCr::new(sys, &[0], &[], BracketData::default(), 1.0, 9).unwrap();
    let plan = InterventionPlan {
        events: vec![InterventionEvent {
            time: 0.5,
            actions: vec![InterventionAction::SpeciesSet {
                species: 0,
                value: 7,
            }],
        }],
    };
    let sol = SsaStepper::new(Aggregator::from(agg), vec![0], vec![], (0.0, 1.0))
        .unwrap()
        .with_interventions(plan)
        .unwrap()
        .solve()
        .unwrap();
    assert_eq!(sol.final_state(), Some(&[7][..]));
}

#[test]
fn rate_set_interventions_retune_the_aggregator() {
    // death at rate X would empty the state, but the rate is zeroed at t=0
    let ma =
        MassActionJump::new(vec![1.0], vec![vec![(0, 1)]], vec![vec![(0, -1)]]).unwrap();
    let sys = JumpSystem::pure_mass_action(ma);
    let agg = RssaCr::new(sys, &[10], &[], BracketData::default(), 2.0, 4).unwrap();
    let plan = InterventionPlan {
        events: vec![InterventionEvent {
            time: 0.0,
            actions: vec![InterventionAction::RateSet {
                reaction: 0,
                value: 0.0,
            }],
        }],
    };
    let sol = SsaStepper::new(Aggregator::from(agg), vec![10], vec![], (0.0, 2.0))
        .unwrap()
        .with_interventions(plan)
        .unwrap()
        .solve()
        .unwrap();
    assert_eq!(sol.final_state(), Some(&[10][..]));
}

#[test]
fn callbacks_can_terminate_the_trajectory() {
    let ma = MassActionJump::new(vec![50.0], vec![vec![]], vec![vec![(0, 1)]]).unwrap();
    let sys = JumpSystem::pure_mass_action(ma);
    let agg = RssaCr::new(sys, &[0], &[], BracketData::default(), 100.0, 31).unwrap();
    let sol = SsaStepper::new(Aggregator::from(agg), vec![0], vec![], (0.0, 100.0))
        .unwrap()
        .with_callback(Box::new(|integ| {
            if integ.u[0] >= 5 {
                integ.terminate();
            }
        }))
        .solve()
        .unwrap();
    assert_eq!(sol.retcode, Retcode::Terminated);
    let last = sol.final_state().unwrap();
    assert!(last[0] >= 5);
    assert!(*sol.t.last().unwrap() < 100.0);
}

#[test]
fn saveat_records_even_when_no_jump_fires() {
    let ma =
        MassActionJump::new(vec![1.0], vec![vec![(0, 1)]], vec![vec![(0, -1)]]).unwrap();
    let sys = JumpSystem::pure_mass_action(ma);
    let agg = RssaCr::new(sys, &[0], &[], BracketData::default(), 1.0, 123).unwrap();
    let sol = SsaStepper::new(Aggregator::from(agg), vec![0], vec![], (0.0, 1.0))
        .unwrap()
        .saveat(vec![0.0, 0.5, 1.0])
        .unwrap()
        .solve()
        .unwrap();
    assert_eq!(sol.t, vec![0.0, 0.5, 1.0]);
    assert!(sol.u.iter().all(|u| u == &[0]));
}

#[test]
fn ensembles_are_reproducible_across_runs() {
    let build = |seed: u64| {
        let agg = RssaCr::new(
            birth_death_system(),
            &[5],
            &[],
            BracketData::default(),
            5.0,
            seed,
        )?;
        SsaStepper::new(Aggregator::from(agg), vec![5], vec![], (0.0, 5.0))?
            .saveat(vec![1.0, 3.0, 5.0])
    };
    let a = run_ensemble(4, Some(2), Some(123), build).unwrap();
    let b = run_ensemble(4, Some(2), Some(123), build).unwrap();
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.u, y.u);
        assert_eq!(x.t, y.t);
    }
}

fn diffusion_stepper(seed: u64) -> Result<SsaStepper, SimError> {
    let grid = CartesianGrid::new(&[5, 5])?;
    let sys = SpatialSystem::new(MassActionJump::empty(), vec![2.5], grid, 1)?;
    let mut u0 = vec![0i32; 25];
    u0[12] = 100; // centre of the lattice
    let agg = RssaCrDirect::new(sys, &u0, BracketData::default(), 0.05, seed)?;
    SsaStepper::new(Aggregator::from(agg), u0, vec![], (0.0, 0.05))?.saveat(vec![0.05])
}

#[test]
fn spatial_diffusion_conserves_mass_and_spreads_like_the_heat_kernel() {
    let n_traj = 400;
    let sols = run_ensemble(n_traj, Some(2), Some(777), diffusion_stepper).unwrap();
    for sol in &sols {
        let total: i32 = sol.u[0].iter().sum();
        assert_eq!(total, 100);
    }

    // per-axis first and second moments of the particle cloud at t = 0.05:
    // hops along each axis occur at rate 2.5 in both directions, so the
    // displacement variance per axis is 2 * 2.5 * t = 0.25
    let mut mean_x = 0.0;
    let mut mean_sq = 0.0;
    let mut count = 0.0;
    for sol in &sols {
        for (site, &n) in sol.u[0].iter().enumerate() {
            let x = (site % 5) as f64;
            mean_x += n as f64 * x;
            mean_sq += n as f64 * x * x;
            count += n as f64;
        }
    }
    mean_x /= count;
    mean_sq /= count;
    let var_x = mean_sq - mean_x * mean_x;
    assert!((mean_x - 2.0).abs() < 0.02, "mean x drifted: {}", mean_x);
    assert!(
        (var_x - 0.25).abs() < 0.035,
        "variance {} far from 0.25",
        var_x
    );
}

#[test]
fn single_walker_hops_between_neighbouring_sites() {
    let grid = CartesianGrid::new(&[2]).unwrap();
    let sys = SpatialSystem::new(MassActionJump::empty(), vec![1.0], grid, 1).unwrap();
    let agg = RssaCrDirect::new(sys, &[1, 0], BracketData::default(), 5.0, 8).unwrap();
    let sol = SsaStepper::new(Aggregator::from(agg), vec![1, 0], vec![], (0.0, 5.0))
        .unwrap()
        .solve()
        .unwrap();
    assert!(sol.len() >= 2);
    for u in &sol.u {
        assert_eq!(u[0] + u[1], 1);
        assert!(u[0] >= 0 && u[1] >= 0);
    }
    // the walker must actually move
    assert!(sol.u.iter().any(|u| u[1] == 1));
}

#[test]
fn spatial_reactions_fire_at_their_sites() {
    // pure decay at every site, no hopping: totals fall monotonically and
    // sites never go negative
    let grid = CartesianGrid::new(&[3]).unwrap();
    let decay =
        MassActionJump::new(vec![1.0], vec![vec![(0, 1)]], vec![vec![(0, -1)]]).unwrap();
    let sys = SpatialSystem::new(decay, vec![0.0], grid, 1).unwrap();
    let u0 = vec![5, 0, 3];
    let agg = RssaCrDirect::new(sys, &u0, BracketData::default(), 50.0, 17).unwrap();
    let sol = SsaStepper::new(Aggregator::from(agg), u0, vec![], (0.0, 50.0))
        .unwrap()
        .solve()
        .unwrap();
    for pair in sol.u.windows(2) {
        let before: i32 = pair[0].iter().sum();
        let after: i32 = pair[1].iter().sum();
        assert!(after <= before);
    }
    let last = sol.final_state().unwrap();
    assert_eq!(last[1], 0);
    assert!(last.iter().all(|&n| n >= 0));
    // everything decays well before t = 50
    assert_eq!(last.iter().sum::<i32>(), 0);
}
