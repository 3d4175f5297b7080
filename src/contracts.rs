//! Contract Definitions
//!
//! Solidity interfaces used by the engine, defined with alloy's `sol!` macro.
//! `#[sol(rpc)]` generates instance types that can make calls through any
//! alloy Provider; the plain call structs are used for calldata encoding.

use alloy::sol;

// ── Uniswap V2 (and forks) ───────────────────────────────────────────

sol! {
    #[sol(rpc)]
    interface IUniswapV2Factory {
        function allPairs(uint256) external view returns (address pair);
        function allPairsLength() external view returns (uint256);
    }
}

sol! {
    #[sol(rpc)]
    interface IUniswapV2Pair {
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
        function token0() external view returns (address);
        function token1() external view returns (address);
        function swap(uint256 amount0Out, uint256 amount1Out, address to, bytes calldata data) external;
    }
}

// ── Bundle executor (atomic arb contract, address from configuration) ─

sol! {
    #[sol(rpc)]
    interface IBundleExecutor {
        function uniswapWeth(uint256 _wethAmountToFirstMarket, uint256 _ethAmountToCoinbase, address[] memory _targets, bytes[] memory _payloads) external payable;
        function roundTrip(address _market, uint256 _wethAmount) external;
    }
}
